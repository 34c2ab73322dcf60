//! Decides where indexing starts and ends and hands work to the Crawler and
//! then the Watcher.

use crate::chain::ChainReader;
use crate::config::{IndexerConfig, SyncMode};
use crate::crawler::Crawler;
use crate::cursor::BlockRange;
use crate::deployment::find_deployment_block;
use crate::error::IndexerError;
use crate::processor::EventProcessor;
use crate::retry::{RetryPolicy, retry_until_cancelled, sleep_or_cancel};
use crate::sweeper::run_publish_sweeper;
use crate::watcher::{Watcher, WatcherState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    pub sync_mode: SyncMode,
    pub target_block_number: Option<u64>,
    /// Overrides deployment-block discovery.
    pub genesis_block: Option<u64>,
    pub confirmations: u64,
    pub poll_interval: Duration,
    /// Upper bound on the backoff between head lookups.
    pub head_backoff: Duration,
    pub publish_sweep_interval: Duration,
    pub publish_grace_period: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// One-shot backfill finished at the target block.
    ReachedTarget(u64),
    /// Cancelled while tailing or catching up.
    Stopped,
}

pub struct SyncCoordinator {
    config: SyncConfig,
    reader: Arc<dyn ChainReader>,
    processor: Arc<EventProcessor>,
    crawler: Arc<Crawler>,
    watcher: Watcher,
}

impl SyncCoordinator {
    pub fn new(
        config: &IndexerConfig,
        reader: Arc<dyn ChainReader>,
        processor: Arc<EventProcessor>,
    ) -> Self {
        let crawler = Arc::new(Crawler::new(
            config.crawler_config(),
            reader.clone(),
            processor.clone(),
        ));
        let watcher = Watcher::new(config.watcher_config(), reader.clone(), crawler.clone());
        Self {
            config: config.sync_config(),
            reader,
            processor,
            crawler,
            watcher,
        }
    }

    pub fn watcher_state(&self) -> watch::Receiver<WatcherState> {
        self.watcher.state()
    }

    /// Runs until the target block is committed, or forever without a target.
    /// Cancellation is a clean stop, not an error.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<SyncOutcome, IndexerError> {
        match self.sync(cancel).await {
            Err(e) if e.is_cancelled() => {
                info!("Sync for {} stopped", self.processor.target());
                Ok(SyncOutcome::Stopped)
            }
            result => result,
        }
    }

    async fn sync(&self, cancel: &CancellationToken) -> Result<SyncOutcome, IndexerError> {
        let target = *self.processor.target();
        let genesis = self.resolve_genesis(cancel).await?;

        let start = match self.config.sync_mode {
            SyncMode::Resync => genesis,
            SyncMode::Continue => {
                let store = self.processor.store();
                retry_until_cancelled("Reading cursor", self.head_policy(), cancel, || {
                    store.get_cursor(&target)
                })
                .await?
                .map_or(genesis, |cursor| cursor.saturating_add(1).max(genesis))
            }
        };
        info!(
            "Syncing {} in {} mode from block {} (genesis {})",
            target, self.config.sync_mode, start, genesis
        );

        let sweep_cancel = cancel.child_token();
        let _sweep_guard = sweep_cancel.clone().drop_guard();
        tokio::spawn(run_publish_sweeper(
            self.processor.clone(),
            self.config.publish_sweep_interval,
            self.config.publish_grace_period,
            sweep_cancel,
        ));

        if let Some(target_block) = self.config.target_block_number {
            return self.backfill_to(start, target_block, cancel).await;
        }

        let head = self.head_block_number(cancel).await?;
        let mut next = start;
        let confirmed = head.checked_sub(self.config.confirmations);
        if let Some((range, end)) =
            confirmed.and_then(|end| BlockRange::new(start, end).map(|range| (range, end)))
        {
            self.crawler.crawl(range, cancel).await?;
            next = end + 1;
        }

        info!("Caught up to block {}, handing over to the watcher", next.saturating_sub(1));
        self.watcher.run(next, cancel).await?;
        Ok(SyncOutcome::Stopped)
    }

    /// Crawls up to `target_block`, waiting for it to be confirmed if needed.
    async fn backfill_to(
        &self,
        start: u64,
        target_block: u64,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, IndexerError> {
        if start > target_block {
            if self.config.sync_mode == SyncMode::Resync {
                return Err(IndexerError::Configuration(format!(
                    "resync starts at genesis block {} which is above target block {}",
                    start, target_block
                )));
            }
            info!(
                "Already indexed past target block {}, nothing to do",
                target_block
            );
            return Ok(SyncOutcome::ReachedTarget(target_block));
        }

        let mut next = start;
        loop {
            let head = self.head_block_number(cancel).await?;
            // Nothing is confirmed while the chain is shorter than K
            let upto = head
                .checked_sub(self.config.confirmations)
                .map(|confirmed| confirmed.min(target_block));
            if let Some((range, upto)) =
                upto.and_then(|upto| BlockRange::new(next, upto).map(|range| (range, upto)))
            {
                self.crawler.crawl(range, cancel).await?;
                next = upto + 1;
            }
            if next > target_block {
                info!("Reached target block {}", target_block);
                return Ok(SyncOutcome::ReachedTarget(target_block));
            }

            info!(
                "Waiting for target block {} to be confirmed (head {})",
                target_block, head
            );
            sleep_or_cancel(self.config.poll_interval, cancel).await?;
        }
    }

    async fn resolve_genesis(&self, cancel: &CancellationToken) -> Result<u64, IndexerError> {
        if let Some(genesis) = self.config.genesis_block {
            return Ok(genesis);
        }

        let target = *self.processor.target();
        let store = self.processor.store();
        let cached = retry_until_cancelled("Reading genesis block", self.head_policy(), cancel, || {
            store.genesis_block(&target)
        })
        .await?;
        if let Some(genesis) = cached {
            info!("Using cached genesis block {}", genesis);
            return Ok(genesis);
        }

        let head = self.head_block_number(cancel).await?;
        let reader = &*self.reader;
        let genesis = retry_until_cancelled(
            "Searching deployment block",
            self.head_policy(),
            cancel,
            || find_deployment_block(reader, target.contract_address, head),
        )
        .await?;

        retry_until_cancelled("Recording genesis block", self.head_policy(), cancel, || {
            store.record_genesis_block(&target, genesis)
        })
        .await?;
        Ok(genesis)
    }

    async fn head_block_number(&self, cancel: &CancellationToken) -> Result<u64, IndexerError> {
        retry_until_cancelled("Fetching head block", self.head_policy(), cancel, || {
            self.reader.head_block_number()
        })
        .await
    }

    fn head_policy(&self) -> RetryPolicy {
        let max = self.config.head_backoff;
        RetryPolicy::new(max.min(Duration::from_millis(100)), max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::WatchTarget;
    use crate::events::BridgeEventKind;
    use crate::mock::{MockChainReader, MockQueue, message_sent_log};
    use crate::processor::DecodedBatch;
    use crate::repository::Database;
    use crate::store::{EventStore, SqliteEventStore};
    use alloy_primitives::Address;
    use std::collections::HashMap;

    const CONTRACT: Address = Address::repeat_byte(0x12);

    fn config(vars: &[(&str, &str)]) -> IndexerConfig {
        let mut all: HashMap<String, String> = HashMap::from([
            ("SRC_RPC_URLS".to_string(), "http://localhost:8545".to_string()),
            ("SRC_BRIDGE_ADDRESS".to_string(), format!("{:?}", CONTRACT)),
            ("BLOCK_BATCH_SIZE".to_string(), "10".to_string()),
            ("NUM_GOROUTINES".to_string(), "3".to_string()),
        ]);
        for (k, v) in vars {
            all.insert(k.to_string(), v.to_string());
        }
        let mut config = IndexerConfig::from_lookup(|name| all.get(name).cloned()).unwrap();
        config.poll_interval = Duration::from_millis(20);
        config.subscription_backoff = Duration::from_millis(5);
        config.retry_max_delay = Duration::from_millis(5);
        config
    }

    fn setup(
        config: &IndexerConfig,
        reader: Arc<MockChainReader>,
    ) -> (SyncCoordinator, SqliteEventStore) {
        let store = SqliteEventStore::new(Database::in_memory().unwrap());
        let processor = Arc::new(EventProcessor::new(
            WatchTarget {
                src_chain_id: 1,
                contract_address: CONTRACT,
                event: BridgeEventKind::MessageSent,
            },
            None,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(MockQueue::new()),
        ));
        (SyncCoordinator::new(config, reader, processor), store)
    }

    #[tokio::test]
    async fn continue_resumes_after_the_cursor() {
        let reader = Arc::new(MockChainReader::new(1, 500));
        let config = config(&[("GENESIS_BLOCK", "0"), ("TARGET_BLOCK_NUMBER", "160")]);
        let (coordinator, store) = setup(&config, reader.clone());
        coordinator
            .processor
            .commit_range(BlockRange::new(0, 120).unwrap(), DecodedBatch::default())
            .await
            .unwrap();

        let outcome = coordinator.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, SyncOutcome::ReachedTarget(160));
        assert_eq!(reader.calls().iter().map(|c| c.0).min(), Some(121));
        assert_eq!(
            store.get_cursor(coordinator.processor.target()).await.unwrap(),
            Some(160)
        );
    }

    #[tokio::test]
    async fn genesis_is_discovered_once_and_cached() {
        let reader = Arc::new(MockChainReader::new(1, 500));
        reader.set_deployment_block(42);
        reader.add_log(message_sent_log(CONTRACT, 45, 0, 1));
        let config = config(&[("SYNC_MODE", "resync"), ("TARGET_BLOCK_NUMBER", "60")]);
        let (coordinator, store) = setup(&config, reader.clone());

        coordinator.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(reader.calls().iter().map(|c| c.0).min(), Some(42));
        assert_eq!(
            store.genesis_block(coordinator.processor.target()).await.unwrap(),
            Some(42)
        );
    }

    #[tokio::test]
    async fn cursor_past_target_terminates_without_crawling() {
        let reader = Arc::new(MockChainReader::new(1, 500));
        let config = config(&[("GENESIS_BLOCK", "0"), ("TARGET_BLOCK_NUMBER", "50")]);
        let (coordinator, _store) = setup(&config, reader.clone());
        coordinator
            .processor
            .commit_range(BlockRange::new(0, 80).unwrap(), DecodedBatch::default())
            .await
            .unwrap();

        let outcome = coordinator.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, SyncOutcome::ReachedTarget(50));
        assert!(reader.calls().is_empty());
    }

    #[tokio::test]
    async fn resync_with_genesis_above_target_is_a_configuration_error() {
        let reader = Arc::new(MockChainReader::new(1, 500));
        reader.set_deployment_block(300);
        let config = config(&[("SYNC_MODE", "resync"), ("TARGET_BLOCK_NUMBER", "150")]);
        let (coordinator, _store) = setup(&config, reader.clone());

        let err = coordinator.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, IndexerError::Configuration(_)));
        assert!(reader.calls().is_empty());
    }

    #[tokio::test]
    async fn target_waits_for_confirmations() {
        let reader = Arc::new(MockChainReader::new(1, 100));
        let config = config(&[("GENESIS_BLOCK", "90"), ("TARGET_BLOCK_NUMBER", "100")]);
        let (coordinator, store) = setup(&config, reader.clone());

        let cancel = CancellationToken::new();
        let raise_head = {
            let reader = reader.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                reader.set_head(110);
            }
        };
        let (outcome, ()) = tokio::join!(coordinator.run(&cancel), raise_head);

        assert_eq!(outcome.unwrap(), SyncOutcome::ReachedTarget(100));
        assert_eq!(
            store.get_cursor(coordinator.processor.target()).await.unwrap(),
            Some(100)
        );
        assert!(reader.calls().iter().all(|c| c.1 <= 100));
    }

    #[tokio::test]
    async fn short_chain_commits_nothing_until_confirmed() {
        let reader = Arc::new(MockChainReader::new(1, 3));
        reader.add_log(message_sent_log(CONTRACT, 0, 0, 1));
        let config = config(&[("GENESIS_BLOCK", "0"), ("TARGET_BLOCK_NUMBER", "2")]);
        let (coordinator, store) = setup(&config, reader.clone());
        let target = *coordinator.processor.target();

        let cancel = CancellationToken::new();
        let check_then_raise = {
            let reader = reader.clone();
            let store = store.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                assert!(reader.calls().is_empty());
                assert_eq!(store.get_cursor(&target).await.unwrap(), None);
                reader.set_head(7);
            }
        };
        let (outcome, ()) = tokio::join!(coordinator.run(&cancel), check_then_raise);

        assert_eq!(outcome.unwrap(), SyncOutcome::ReachedTarget(2));
        assert_eq!(store.get_cursor(&target).await.unwrap(), Some(2));
        assert!(reader.calls().iter().all(|c| c.0 == 0 && c.1 <= 2));
    }

    #[tokio::test]
    async fn head_lookup_failures_are_retried() {
        let reader = Arc::new(MockChainReader::new(1, 200));
        reader.fail_head_lookups(3);
        let config = config(&[("GENESIS_BLOCK", "100")]);
        let (coordinator, store) = setup(&config, reader.clone());

        let cancel = CancellationToken::new();
        let stop = {
            let cancel = cancel.clone();
            let store = store.clone();
            let target = *coordinator.processor.target();
            async move {
                while store.get_cursor(&target).await.unwrap() != Some(195) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                cancel.cancel();
            }
        };
        let (outcome, ()) = tokio::join!(coordinator.run(&cancel), stop);
        assert_eq!(outcome.unwrap(), SyncOutcome::Stopped);
    }
}
