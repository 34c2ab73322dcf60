//! Error taxonomy for the indexing pipeline.

use crate::events::EventKey;
use thiserror::Error;

/// Errors raised by the chain reader, the stores and the pipeline components.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// RPC, network or database hiccup. Retried with backoff, never fatal.
    #[error("transient I/O error: {0}")]
    Transient(String),

    /// The endpoint rejected the request in a way a plain retry will not fix.
    #[error("fatal RPC error: {0}")]
    Fatal(String),

    /// A log did not match the expected event shape.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Invalid range or conflicting modes. Aborts startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The identity key is already stored. Callers treat this as success.
    #[error("event {0} is already stored")]
    PersistenceConflict(EventKey),

    #[error("shutdown requested")]
    Cancelled,
}

impl IndexerError {
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::Transient(err.to_string())
    }

    /// Everything except configuration problems and shutdown is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Configuration(_) | Self::Cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<anyhow::Error> for IndexerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Transient(format!("{err:#}"))
    }
}

/// Why a single log could not be turned into an [`Event`](crate::events::Event).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("log is missing {0}")]
    MissingField(&'static str),

    #[error("unexpected event signature {0}")]
    UnexpectedSignature(String),

    #[error("ABI decoding failed: {0}")]
    Abi(String),
}
