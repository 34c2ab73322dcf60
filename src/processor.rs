//! The single path from a raw log to a stored event and a queued relay task.
//!
//! Deduplication relies on the store's unique identity key; the `exists` and
//! suspended lookups only save work. A publish failure leaves the event `new`
//! so that [`EventProcessor::republish_stale`] picks it up later. Inline
//! publishing and the sweep never overlap, so a slow queue cannot make the
//! sweep grab events the inline loop has not reached yet.

use crate::cursor::{BlockRange, WatchTarget};
use crate::error::IndexerError;
use crate::events::{DecodeFailure, Event, EventKey, EventStatus, RawLog, decode_event};
use crate::queue::{QueueMessage, QueuePublisher};
use crate::store::{BatchCommit, EventStore, SuspendedTransactions};
use alloy_primitives::Address;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const SWEEP_PAGE_SIZE: usize = 500;

/// Logs of one block range, decoded but not yet written.
#[derive(Debug, Clone, Default)]
pub struct DecodedBatch {
    pub events: Vec<Event>,
    pub decode_failures: Vec<DecodeFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub stored: usize,
    pub duplicates: usize,
    pub suspended: usize,
    pub decode_failures: usize,
    pub published: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutcome {
    Published,
    /// Stored but the queue refused it; the sweep will retry.
    StoredUnpublished,
    Duplicate,
    Suspended,
    Removed,
    DecodeFailed,
}

pub struct EventProcessor {
    target: WatchTarget,
    dest_bridge_address: Option<Address>,
    store: Arc<dyn EventStore>,
    suspended: Arc<dyn SuspendedTransactions>,
    queue: Arc<dyn QueuePublisher>,
    /// Held from insert until the inline publish loop ends, and by the sweep.
    publishing: Mutex<()>,
}

impl EventProcessor {
    pub fn new(
        target: WatchTarget,
        dest_bridge_address: Option<Address>,
        store: Arc<dyn EventStore>,
        suspended: Arc<dyn SuspendedTransactions>,
        queue: Arc<dyn QueuePublisher>,
    ) -> Self {
        Self {
            target,
            dest_bridge_address,
            store,
            suspended,
            queue,
            publishing: Mutex::new(()),
        }
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Decodes a batch of logs. CPU only, never suspends.
    pub fn decode(&self, logs: &[RawLog]) -> DecodedBatch {
        let mut batch = DecodedBatch::default();
        for log in logs.iter().filter(|log| !log.removed) {
            match decode_event(self.target.event, self.target.src_chain_id, log) {
                Ok(event) => batch.events.push(event),
                Err(e) => {
                    error!(
                        alert = true,
                        "Failed to decode {} log in block {:?} (tx {:?}, index {:?}): {}",
                        self.target.event,
                        log.block_number,
                        log.transaction_hash,
                        log.log_index,
                        e
                    );
                    batch
                        .decode_failures
                        .push(DecodeFailure::new(self.target.src_chain_id, log, &e));
                }
            }
        }
        batch
    }

    /// Stores a decoded range and advances the cursor to `range.to` in the same
    /// transaction, then publishes what was new.
    pub async fn commit_range(
        &self,
        range: BlockRange,
        batch: DecodedBatch,
    ) -> Result<BatchReport, IndexerError> {
        self.commit(Some(range), batch).await
    }

    /// Push path: one log, no cursor movement.
    pub async fn process_log(&self, log: RawLog) -> Result<LogOutcome, IndexerError> {
        if log.removed {
            return Ok(LogOutcome::Removed);
        }

        let batch = self.decode(std::slice::from_ref(&log));
        let report = self.commit(None, batch).await?;

        Ok(if report.decode_failures > 0 {
            LogOutcome::DecodeFailed
        } else if report.suspended > 0 {
            LogOutcome::Suspended
        } else if report.duplicates > 0 {
            LogOutcome::Duplicate
        } else if report.published > 0 {
            LogOutcome::Published
        } else {
            LogOutcome::StoredUnpublished
        })
    }

    async fn commit(
        &self,
        range: Option<BlockRange>,
        batch: DecodedBatch,
    ) -> Result<BatchReport, IndexerError> {
        let mut report = BatchReport {
            decode_failures: batch.decode_failures.len(),
            ..Default::default()
        };

        let mut fresh = Vec::with_capacity(batch.events.len());
        let mut seen = HashSet::new();
        for event in batch.events {
            let key = event.key();
            if !seen.insert(key) {
                report.duplicates += 1;
            } else if self.suspended.is_suspended(&key).await? {
                debug!("Skipping suspended event {}", key);
                report.suspended += 1;
            } else if self.store.exists(&key).await? {
                report.duplicates += 1;
            } else {
                fresh.push(event);
            }
        }

        let _publishing = self.publishing.lock().await;
        let inserted = self
            .store
            .commit_batch(BatchCommit {
                target: self.target,
                range,
                events: fresh.clone(),
                decode_failures: batch.decode_failures,
            })
            .await?;

        // Lost a race with a concurrent writer of the same key
        let inserted: HashSet<EventKey> = inserted.into_iter().collect();
        for event in fresh.iter().filter(|e| !inserted.contains(&e.key())) {
            debug!("{}, skipping", IndexerError::PersistenceConflict(event.key()));
            report.duplicates += 1;
        }
        report.stored = inserted.len();

        for event in fresh.iter().filter(|e| inserted.contains(&e.key())) {
            if self.publish(event).await {
                report.published += 1;
            }
        }

        if let Some(range) = range {
            info!(
                "Committed blocks {} for {}: {} stored, {} published, {} duplicates, {} suspended, {} decode failures",
                range,
                self.target,
                report.stored,
                report.published,
                report.duplicates,
                report.suspended,
                report.decode_failures
            );
        }

        Ok(report)
    }

    /// Publishes a stored event and marks it queued. A failure is logged and
    /// left for the sweep; the event stays durable either way.
    async fn publish(&self, event: &Event) -> bool {
        let key = event.key();
        let message = QueueMessage::from_event(event, self.dest_bridge_address);

        if let Err(e) = self.queue.publish(&message).await {
            error!(
                alert = true,
                "Failed to publish event {}, leaving it for the sweep: {}", key, e
            );
            return false;
        }

        if let Err(e) = self.store.set_status(&key, EventStatus::Queued).await {
            // Published but still `new`: the sweep will publish it again and
            // the consumer deduplicates on the key.
            warn!("Published event {} but failed to mark it queued: {}", key, e);
        }
        true
    }

    /// Re-attempts publication of `new` events older than `grace`. Returns how
    /// many were published.
    pub async fn republish_stale(&self, grace: Duration) -> Result<usize, IndexerError> {
        let _publishing = self.publishing.lock().await;
        let stale = self.store.unpublished(grace, SWEEP_PAGE_SIZE).await?;
        if stale.is_empty() {
            return Ok(0);
        }

        info!("Found {} unpublished events older than {:?}", stale.len(), grace);
        let mut published = 0;
        for event in &stale {
            let key = event.key();
            if self.suspended.is_suspended(&key).await? {
                info!("Event {} was suspended downstream, not publishing", key);
                self.store.set_status(&key, EventStatus::Suspended).await?;
                continue;
            }
            if self.publish(event).await {
                published += 1;
            }
        }
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BridgeEventKind;
    use crate::mock::{MockQueue, malformed_log, message_sent_log};
    use crate::repository::{Database, SuspendedTransactionRepository};
    use crate::store::SqliteEventStore;

    const CONTRACT: Address = Address::repeat_byte(0x66);

    fn setup() -> (EventProcessor, SqliteEventStore, Arc<MockQueue>) {
        let store = SqliteEventStore::new(Database::in_memory().unwrap());
        let queue = Arc::new(MockQueue::new());
        let target = WatchTarget {
            src_chain_id: 1,
            contract_address: CONTRACT,
            event: BridgeEventKind::MessageSent,
        };
        let processor = EventProcessor::new(
            target,
            None,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            queue.clone(),
        );
        (processor, store, queue)
    }

    #[tokio::test]
    async fn processing_a_log_twice_stores_and_publishes_once() {
        let (processor, store, queue) = setup();
        let log = message_sent_log(CONTRACT, 10, 0, 1);

        assert_eq!(
            processor.process_log(log.clone()).await.unwrap(),
            LogOutcome::Published
        );
        assert_eq!(
            processor.process_log(log.clone()).await.unwrap(),
            LogOutcome::Duplicate
        );

        assert_eq!(queue.published().len(), 1);
        let key = processor.decode(&[log]).events[0].key();
        let stored = store
            .database()
            .with_conn(|conn| crate::repository::EventRepository::new(conn).get(&key))
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, EventStatus::Queued);
    }

    #[tokio::test]
    async fn suspended_events_are_never_republished() {
        let (processor, store, queue) = setup();
        let log = message_sent_log(CONTRACT, 10, 0, 1);
        let key = processor.decode(std::slice::from_ref(&log)).events[0].key();
        store
            .database()
            .with_conn(|conn| SuspendedTransactionRepository::new(conn).insert(&key, "gave up"))
            .unwrap();

        assert_eq!(processor.process_log(log).await.unwrap(), LogOutcome::Suspended);
        assert!(queue.published().is_empty());
        assert!(!store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn failed_publish_is_recovered_by_the_sweep() {
        let (processor, store, queue) = setup();
        queue.fail_next(1);
        let log = message_sent_log(CONTRACT, 10, 0, 1);

        assert_eq!(
            processor.process_log(log.clone()).await.unwrap(),
            LogOutcome::StoredUnpublished
        );
        assert!(queue.published().is_empty());
        assert_eq!(store.unpublished(Duration::ZERO, 10).await.unwrap().len(), 1);

        assert_eq!(processor.republish_stale(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(queue.published().len(), 1);
        assert!(store.unpublished(Duration::ZERO, 10).await.unwrap().is_empty());

        // a later rediscovery does not publish again
        assert_eq!(processor.process_log(log).await.unwrap(), LogOutcome::Duplicate);
        assert_eq!(queue.published().len(), 1);
    }

    #[tokio::test]
    async fn sweep_marks_events_suspended_downstream() {
        let (processor, store, queue) = setup();
        queue.fail_next(1);
        let log = message_sent_log(CONTRACT, 10, 0, 1);
        processor.process_log(log.clone()).await.unwrap();

        let key = processor.decode(&[log]).events[0].key();
        store
            .database()
            .with_conn(|conn| SuspendedTransactionRepository::new(conn).insert(&key, "gave up"))
            .unwrap();

        assert_eq!(processor.republish_stale(Duration::ZERO).await.unwrap(), 0);
        assert!(queue.published().is_empty());
        assert!(store.unpublished(Duration::ZERO, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_log_is_recorded_not_dropped() {
        let (processor, store, queue) = setup();
        let mut logs: Vec<RawLog> = (0..9)
            .map(|i| message_sent_log(CONTRACT, 20, i, i))
            .collect();
        logs.insert(4, malformed_log(CONTRACT, 20, 99));

        let batch = processor.decode(&logs);
        assert_eq!(batch.events.len(), 9);
        assert_eq!(batch.decode_failures.len(), 1);

        let report = processor
            .commit_range(BlockRange::new(20, 29).unwrap(), batch)
            .await
            .unwrap();
        assert_eq!(report.stored, 9);
        assert_eq!(report.published, 9);
        assert_eq!(report.decode_failures, 1);
        assert_eq!(queue.published().len(), 9);
        assert_eq!(store.get_cursor(processor.target()).await.unwrap(), Some(29));
    }

    #[tokio::test]
    async fn sweep_does_not_race_a_slow_inline_publish() {
        let (processor, _store, queue) = setup();
        queue.set_delay(Duration::from_millis(10));
        let logs: Vec<RawLog> = (0..8)
            .map(|i| message_sent_log(CONTRACT, 30, i, i))
            .collect();
        let batch = processor.decode(&logs);

        let commit = processor.commit_range(BlockRange::new(30, 39).unwrap(), batch);
        let sweep = async {
            let mut swept = 0;
            for _ in 0..20 {
                swept += processor.republish_stale(Duration::ZERO).await.unwrap();
                tokio::time::sleep(Duration::from_millis(3)).await;
            }
            swept
        };
        let (report, swept) = tokio::join!(commit, sweep);

        assert_eq!(report.unwrap().published, 8);
        assert_eq!(swept, 0);
        let mut ids: Vec<_> = queue.published().iter().map(|m| m.msg_hash).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        assert_eq!(queue.published().len(), 8);
    }

    #[tokio::test]
    async fn removed_logs_are_ignored() {
        let (processor, _store, queue) = setup();
        let mut log = message_sent_log(CONTRACT, 10, 0, 1);
        log.removed = true;
        assert_eq!(processor.process_log(log).await.unwrap(), LogOutcome::Removed);
        assert!(queue.published().is_empty());
    }
}
