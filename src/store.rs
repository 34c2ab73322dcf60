//! Event Store and suspended-transaction capabilities, and their SQLite
//! implementation.

use crate::cursor::{BlockRange, WatchTarget};
use crate::error::IndexerError;
use crate::events::{DecodeFailure, Event, EventKey, EventStatus};
use crate::repository::database::now_millis;
use crate::repository::{
    CursorRepository, Database, DecodeFailureRepository, EventRepository,
    SuspendedTransactionRepository,
};
use async_trait::async_trait;
use std::time::Duration;

/// Everything one batch writes. Applied atomically by [`EventStore::commit_batch`].
#[derive(Debug, Clone)]
pub struct BatchCommit {
    pub target: WatchTarget,
    /// Range whose end becomes the new cursor. `None` stores events without
    /// moving the cursor (push-delivered logs).
    pub range: Option<BlockRange>,
    pub events: Vec<Event>,
    pub decode_failures: Vec<DecodeFailure>,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn get_cursor(&self, target: &WatchTarget) -> Result<Option<u64>, IndexerError>;

    /// Writes all events and failures and advances the cursor, or does nothing.
    /// Returns the keys of events that were not stored before.
    async fn commit_batch(&self, commit: BatchCommit) -> Result<Vec<EventKey>, IndexerError>;

    async fn exists(&self, key: &EventKey) -> Result<bool, IndexerError>;

    async fn set_status(&self, key: &EventKey, status: EventStatus) -> Result<(), IndexerError>;

    /// `new` events at least `min_age` old.
    async fn unpublished(
        &self,
        min_age: Duration,
        limit: usize,
    ) -> Result<Vec<Event>, IndexerError>;

    async fn genesis_block(&self, target: &WatchTarget) -> Result<Option<u64>, IndexerError>;

    async fn record_genesis_block(
        &self,
        target: &WatchTarget,
        block_number: u64,
    ) -> Result<(), IndexerError>;
}

/// Read-only view of the relay executor's suspended transactions.
#[async_trait]
pub trait SuspendedTransactions: Send + Sync {
    async fn is_suspended(&self, key: &EventKey) -> Result<bool, IndexerError>;
}

#[derive(Clone)]
pub struct SqliteEventStore {
    db: Database,
}

impl SqliteEventStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn get_cursor(&self, target: &WatchTarget) -> Result<Option<u64>, IndexerError> {
        let target = *target;
        Ok(self
            .db
            .run(move |conn| CursorRepository::new(conn).get_last_processed_block(&target))
            .await?)
    }

    async fn commit_batch(&self, commit: BatchCommit) -> Result<Vec<EventKey>, IndexerError> {
        Ok(self
            .db
            .run(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let inserted = EventRepository::new(&tx).insert_batch(&commit.events)?;
                DecodeFailureRepository::new(&tx).insert_batch(&commit.decode_failures)?;
                if let Some(range) = commit.range {
                    CursorRepository::new(&tx).advance(&commit.target, range.to)?;
                }
                tx.commit()?;
                Ok(inserted)
            })
            .await?)
    }

    async fn exists(&self, key: &EventKey) -> Result<bool, IndexerError> {
        let key = *key;
        Ok(self
            .db
            .run(move |conn| EventRepository::new(conn).exists(&key))
            .await?)
    }

    async fn set_status(&self, key: &EventKey, status: EventStatus) -> Result<(), IndexerError> {
        let key = *key;
        Ok(self
            .db
            .run(move |conn| EventRepository::new(conn).update_status(&key, status))
            .await?)
    }

    async fn unpublished(
        &self,
        min_age: Duration,
        limit: usize,
    ) -> Result<Vec<Event>, IndexerError> {
        let created_before = now_millis() - min_age.as_millis() as i64;
        Ok(self
            .db
            .run(move |conn| EventRepository::new(conn).find_unpublished(created_before, limit))
            .await?)
    }

    async fn genesis_block(&self, target: &WatchTarget) -> Result<Option<u64>, IndexerError> {
        let target = *target;
        Ok(self
            .db
            .run(move |conn| CursorRepository::new(conn).get_genesis_block(&target))
            .await?)
    }

    async fn record_genesis_block(
        &self,
        target: &WatchTarget,
        block_number: u64,
    ) -> Result<(), IndexerError> {
        let target = *target;
        Ok(self
            .db
            .run(move |conn| CursorRepository::new(conn).set_genesis_block(&target, block_number))
            .await?)
    }
}

#[async_trait]
impl SuspendedTransactions for SqliteEventStore {
    async fn is_suspended(&self, key: &EventKey) -> Result<bool, IndexerError> {
        let key = *key;
        Ok(self
            .db
            .run(move |conn| SuspendedTransactionRepository::new(conn).is_suspended(&key))
            .await?)
    }
}
