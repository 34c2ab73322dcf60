//! Read access to the source chain.

use crate::error::IndexerError;
use crate::events::RawLog;
use alloy_primitives::{Address, B256, Bytes};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Push stream of logs. Ends (or yields an error) when the subscription drops.
pub type LogStream = BoxStream<'static, Result<RawLog, IndexerError>>;

/// Errors are classified as [`IndexerError::Transient`] or [`IndexerError::Fatal`].
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn chain_id(&self) -> Result<u64, IndexerError>;

    async fn head_block_number(&self) -> Result<u64, IndexerError>;

    async fn logs_in_range(
        &self,
        from_block: u64,
        to_block: u64,
        contract: Address,
        event_signature: B256,
    ) -> Result<Vec<RawLog>, IndexerError>;

    async fn subscribe_logs(
        &self,
        contract: Address,
        event_signature: B256,
    ) -> Result<LogStream, IndexerError>;

    /// Contract bytecode at a historical block. Empty before deployment.
    async fn code_at(&self, address: Address, block_number: u64) -> Result<Bytes, IndexerError>;
}
