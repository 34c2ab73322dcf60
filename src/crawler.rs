//! Bounded-range catch-up scanning.
//!
//! A range is cut into batches that a pool of workers fetches and decodes in
//! parallel. Results come back in any order and are committed strictly in
//! batch order, so the cursor only ever moves over blocks whose every lower
//! neighbour is already stored.

use crate::chain::ChainReader;
use crate::cursor::{BlockRange, CommitTracker};
use crate::error::IndexerError;
use crate::processor::{DecodedBatch, EventProcessor};
use crate::retry::{RetryPolicy, retry_until_cancelled};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct CrawlerConfig {
    pub batch_size: u64,
    pub num_workers: usize,
    /// Backoff for failed fetches and commits. Retries never give up.
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlSummary {
    pub batches: usize,
    pub stored: usize,
    pub published: usize,
    pub decode_failures: usize,
    pub last_committed: Option<u64>,
}

struct Job {
    index: usize,
    range: BlockRange,
    permit: OwnedSemaphorePermit,
}

struct Fetched {
    index: usize,
    range: BlockRange,
    batch: DecodedBatch,
    // Held until the batch commits; bounds how far workers run ahead.
    _permit: OwnedSemaphorePermit,
}

pub struct Crawler {
    config: CrawlerConfig,
    reader: Arc<dyn ChainReader>,
    processor: Arc<EventProcessor>,
}

impl Crawler {
    pub fn new(
        config: CrawlerConfig,
        reader: Arc<dyn ChainReader>,
        processor: Arc<EventProcessor>,
    ) -> Self {
        Self {
            config,
            reader,
            processor,
        }
    }

    pub fn processor(&self) -> &Arc<EventProcessor> {
        &self.processor
    }

    /// Fetches, stores and publishes every event in `range`, advancing the
    /// cursor batch by batch. Returns once `range.to` is committed.
    ///
    /// On cancellation the batches committed so far stay committed and
    /// `IndexerError::Cancelled` is returned.
    pub async fn crawl(
        &self,
        range: BlockRange,
        cancel: &CancellationToken,
    ) -> Result<CrawlSummary, IndexerError> {
        let start = Instant::now();
        let batches = range.batches(self.config.batch_size);
        let total = batches.len();
        let num_workers = self.config.num_workers.max(1).min(total);

        info!(
            "Crawling blocks {} for {} in {} batches with {} workers",
            range,
            self.processor.target(),
            total,
            num_workers
        );

        let window = Arc::new(Semaphore::new(num_workers * 2));
        let (job_tx, job_rx) = mpsc::channel::<Job>(num_workers);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (done_tx, mut done_rx) = mpsc::channel::<Result<Fetched, IndexerError>>(num_workers * 2);

        // Aborted on drop, so an early return never leaks workers
        let mut tasks = JoinSet::new();

        let dispatch_cancel = cancel.clone();
        tasks.spawn(async move {
            for (index, range) in batches.into_iter().enumerate() {
                let permit = tokio::select! {
                    biased;
                    _ = dispatch_cancel.cancelled() => return,
                    permit = window.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };
                if job_tx.send(Job { index, range, permit }).await.is_err() {
                    return;
                }
            }
        });

        for worker_id in 0..num_workers {
            let job_rx = job_rx.clone();
            let done_tx = done_tx.clone();
            let reader = self.reader.clone();
            let processor = self.processor.clone();
            let policy = self.config.retry;
            let cancel = cancel.clone();

            tasks.spawn(async move {
                loop {
                    let job = { job_rx.lock().await.recv().await };
                    let Some(job) = job else { break };

                    let result = fetch_batch(&*reader, &processor, policy, &cancel, job.range)
                        .await
                        .map(|batch| Fetched {
                            index: job.index,
                            range: job.range,
                            batch,
                            _permit: job.permit,
                        });
                    let failed = result.is_err();
                    if done_tx.send(result).await.is_err() || failed {
                        break;
                    }
                }
                debug!("Crawler worker {} exiting", worker_id);
            });
        }
        drop(done_tx);

        let mut tracker = CommitTracker::new();
        let mut summary = CrawlSummary {
            batches: total,
            ..Default::default()
        };

        while tracker.released() < total {
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IndexerError::Cancelled),
                message = done_rx.recv() => match message {
                    Some(Ok(fetched)) => fetched,
                    Some(Err(e)) => return Err(e),
                    None if cancel.is_cancelled() => return Err(IndexerError::Cancelled),
                    None => {
                        return Err(IndexerError::Fatal(format!(
                            "crawler workers stopped with {} of {} batches committed",
                            tracker.released(),
                            total
                        )));
                    }
                },
            };
            tracker.insert(fetched.index, fetched);

            while let Some(ready) = tracker.pop_ready() {
                let range = ready.range;
                let what = format!("Committing blocks {}", range);
                let report = retry_until_cancelled(&what, self.config.retry, cancel, || {
                    let batch = ready.batch.clone();
                    async move { self.processor.commit_range(range, batch).await }
                })
                .await?;

                summary.stored += report.stored;
                summary.published += report.published;
                summary.decode_failures += report.decode_failures;
                summary.last_committed = Some(range.to);
            }
        }

        info!(
            "Crawled blocks {} in {:?}: {} events stored, {} published, {} decode failures",
            range,
            start.elapsed(),
            summary.stored,
            summary.published,
            summary.decode_failures
        );
        Ok(summary)
    }
}

async fn fetch_batch(
    reader: &dyn ChainReader,
    processor: &EventProcessor,
    policy: RetryPolicy,
    cancel: &CancellationToken,
    range: BlockRange,
) -> Result<DecodedBatch, IndexerError> {
    let target = *processor.target();
    let what = format!("Fetching {} logs for blocks {}", target.event, range);
    let logs = retry_until_cancelled(&what, policy, cancel, || {
        reader.logs_in_range(
            range.from,
            range.to,
            target.contract_address,
            target.event.signature_hash(),
        )
    })
    .await?;

    debug!("Received {} logs for blocks {}", logs.len(), range);
    Ok(processor.decode(&logs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::WatchTarget;
    use crate::events::{BridgeEventKind, EventKey, EventStatus, Event};
    use crate::mock::{MockChainReader, MockQueue, malformed_log, message_sent_log};
    use crate::repository::Database;
    use crate::store::{BatchCommit, EventStore, SqliteEventStore};
    use alloy_primitives::Address;
    use async_trait::async_trait;
    use std::time::Duration;

    const CONTRACT: Address = Address::repeat_byte(0x77);

    fn target() -> WatchTarget {
        WatchTarget {
            src_chain_id: 1,
            contract_address: CONTRACT,
            event: BridgeEventKind::MessageSent,
        }
    }

    fn config(batch_size: u64, num_workers: usize) -> CrawlerConfig {
        CrawlerConfig {
            batch_size,
            num_workers,
            retry: RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(5)),
        }
    }

    /// Records the cursor value of every range commit.
    struct RecordingStore {
        inner: SqliteEventStore,
        commits: std::sync::Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl EventStore for RecordingStore {
        async fn get_cursor(&self, target: &WatchTarget) -> Result<Option<u64>, IndexerError> {
            self.inner.get_cursor(target).await
        }

        async fn commit_batch(&self, commit: BatchCommit) -> Result<Vec<EventKey>, IndexerError> {
            let to = commit.range.map(|r| r.to);
            let inserted = self.inner.commit_batch(commit).await?;
            if let Some(to) = to {
                self.commits.lock().unwrap().push(to);
            }
            Ok(inserted)
        }

        async fn exists(&self, key: &EventKey) -> Result<bool, IndexerError> {
            self.inner.exists(key).await
        }

        async fn set_status(
            &self,
            key: &EventKey,
            status: EventStatus,
        ) -> Result<(), IndexerError> {
            self.inner.set_status(key, status).await
        }

        async fn unpublished(
            &self,
            min_age: Duration,
            limit: usize,
        ) -> Result<Vec<Event>, IndexerError> {
            self.inner.unpublished(min_age, limit).await
        }

        async fn genesis_block(&self, target: &WatchTarget) -> Result<Option<u64>, IndexerError> {
            self.inner.genesis_block(target).await
        }

        async fn record_genesis_block(
            &self,
            target: &WatchTarget,
            block_number: u64,
        ) -> Result<(), IndexerError> {
            self.inner.record_genesis_block(target, block_number).await
        }
    }

    fn setup(
        reader: Arc<MockChainReader>,
        config: CrawlerConfig,
    ) -> (Crawler, Arc<RecordingStore>, Arc<MockQueue>) {
        let sqlite = SqliteEventStore::new(Database::in_memory().unwrap());
        let store = Arc::new(RecordingStore {
            inner: sqlite.clone(),
            commits: std::sync::Mutex::new(Vec::new()),
        });
        let queue = Arc::new(MockQueue::new());
        let processor = Arc::new(EventProcessor::new(
            target(),
            None,
            store.clone(),
            Arc::new(sqlite),
            queue.clone(),
        ));
        (Crawler::new(config, reader, processor), store, queue)
    }

    #[tokio::test]
    async fn every_block_is_queried_exactly_once() {
        let reader = Arc::new(MockChainReader::new(1, 1_000));
        for block in (100..=200).step_by(10) {
            reader.add_log(message_sent_log(CONTRACT, block, 0, block));
        }
        let (crawler, store, queue) = setup(reader.clone(), config(20, 4));

        let summary = crawler
            .crawl(BlockRange::new(100, 200).unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        let mut calls = reader.calls();
        calls.sort();
        let expected: Vec<(u64, u64)> = BlockRange::new(100, 200)
            .unwrap()
            .batches(20)
            .into_iter()
            .map(|b| (b.from, b.to))
            .collect();
        assert_eq!(calls, expected);

        assert_eq!(summary.batches, 6);
        assert_eq!(summary.stored, 11);
        assert_eq!(summary.last_committed, Some(200));
        assert_eq!(queue.published().len(), 11);
        assert_eq!(store.get_cursor(&target()).await.unwrap(), Some(200));
    }

    #[tokio::test]
    async fn cursor_commits_stay_ordered_when_early_batches_are_slow() {
        let reader = Arc::new(MockChainReader::new(1, 1_000));
        reader.delay_range(100, Duration::from_millis(80));
        reader.delay_range(120, Duration::from_millis(40));
        reader.add_log(message_sent_log(CONTRACT, 105, 0, 1));
        let (crawler, store, _queue) = setup(reader, config(20, 4));

        crawler
            .crawl(BlockRange::new(100, 200).unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        let commits = store.commits.lock().unwrap().clone();
        assert_eq!(commits, vec![119, 139, 159, 179, 199, 200]);
    }

    #[tokio::test]
    async fn transient_fetch_failures_are_retried() {
        let reader = Arc::new(MockChainReader::new(1, 1_000));
        reader.fail_range(140, 3);
        reader.add_log(message_sent_log(CONTRACT, 141, 2, 9));
        let (crawler, store, queue) = setup(reader.clone(), config(20, 4));

        crawler
            .crawl(BlockRange::new(100, 200).unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(queue.published().len(), 1);
        assert_eq!(store.get_cursor(&target()).await.unwrap(), Some(200));
        assert_eq!(reader.calls().iter().filter(|c| c.0 == 140).count(), 1);
    }

    #[tokio::test]
    async fn malformed_log_does_not_block_the_batch() {
        let reader = Arc::new(MockChainReader::new(1, 1_000));
        for i in 0..9 {
            reader.add_log(message_sent_log(CONTRACT, 10 + i, 0, i));
        }
        reader.add_log(malformed_log(CONTRACT, 15, 7));
        let (crawler, store, queue) = setup(reader, config(20, 2));

        let summary = crawler
            .crawl(BlockRange::new(10, 29).unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.stored, 9);
        assert_eq!(summary.decode_failures, 1);
        assert_eq!(queue.published().len(), 9);
        assert_eq!(store.get_cursor(&target()).await.unwrap(), Some(29));
    }

    #[tokio::test]
    async fn cancellation_keeps_only_committed_prefix() {
        let reader = Arc::new(MockChainReader::new(1, 1_000));
        reader.fail_range(120, usize::MAX);
        let (crawler, store, _queue) = setup(reader, config(20, 4));

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = crawler
            .crawl(BlockRange::new(100, 200).unwrap(), &cancel)
            .await;
        assert!(matches!(result, Err(IndexerError::Cancelled)));
        assert_eq!(store.get_cursor(&target()).await.unwrap(), Some(119));
    }
}
