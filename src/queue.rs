//! Hand-off of relay tasks to the downstream consumer.

use crate::error::IndexerError;
use crate::events::{BridgeEventKind, Event, EventKey};
use crate::repository::{Database, QueueRepository};
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of one queued relay task.
///
/// Delivery is at-least-once, so consumers deduplicate on `key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub key: EventKey,
    pub event_name: BridgeEventKind,
    pub msg_hash: B256,
    pub block_number: u64,
    pub dest_chain_id: Option<u64>,
    pub dest_bridge_address: Option<Address>,
    pub payload: Value,
}

impl QueueMessage {
    pub fn from_event(event: &Event, dest_bridge_address: Option<Address>) -> Self {
        Self {
            key: event.key(),
            event_name: event.name,
            msg_hash: event.msg_hash,
            block_number: event.block_number,
            dest_chain_id: event.dest_chain_id,
            dest_bridge_address,
            payload: event.payload.clone(),
        }
    }
}

#[async_trait]
pub trait QueuePublisher: Send + Sync {
    /// Durable once this returns `Ok`.
    async fn publish(&self, message: &QueueMessage) -> Result<(), IndexerError>;
}

/// Durable queue stored as an outbox table in its own SQLite database.
#[derive(Clone)]
pub struct SqliteQueue {
    db: Database,
}

impl SqliteQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn len(&self) -> Result<u64, IndexerError> {
        Ok(self
            .db
            .run(|conn| QueueRepository::new(conn).count())
            .await?)
    }

    pub async fn is_empty(&self) -> Result<bool, IndexerError> {
        Ok(self.len().await? == 0)
    }

    /// Reads messages published after `after_id`, returning each with its id.
    pub async fn read_after(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<(i64, QueueMessage)>, IndexerError> {
        let rows = self
            .db
            .run(move |conn| QueueRepository::new(conn).read_after(after_id, limit))
            .await?;
        rows.into_iter()
            .map(|(id, _, body)| {
                serde_json::from_str(&body)
                    .map(|message| (id, message))
                    .map_err(IndexerError::transient)
            })
            .collect()
    }
}

#[async_trait]
impl QueuePublisher for SqliteQueue {
    async fn publish(&self, message: &QueueMessage) -> Result<(), IndexerError> {
        let body = serde_json::to_string(message).map_err(IndexerError::transient)?;
        let key = message.key.to_string();
        self.db
            .run(move |conn| QueueRepository::new(conn).insert(&key, &body))
            .await?;
        Ok(())
    }
}
