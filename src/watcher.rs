//! Live tail of the chain once the Crawler has caught up.
//!
//! Polling mode periodically crawls `[next, head - K]`. Subscription mode
//! keeps a push subscription open and still crawls on every tick, so the
//! cursor only ever advances through range commits; pushed logs either wake
//! up a crawl or are replayed through the processor once all lower blocks are
//! committed. Repeated subscription failures fall back to polling for good.

use crate::chain::ChainReader;
use crate::config::WatchMode;
use crate::crawler::Crawler;
use crate::cursor::BlockRange;
use crate::error::IndexerError;
use crate::events::RawLog;
use crate::processor::LogOutcome;
use crate::retry::{RetryPolicy, sleep_or_cancel};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct WatcherConfig {
    pub mode: WatchMode,
    pub poll_interval: Duration,
    /// Delay between subscription attempts, grown exponentially with jitter.
    pub backoff: RetryPolicy,
    pub max_subscription_failures: usize,
    /// Blocks behind head that are not yet considered confirmed (K).
    pub confirmations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Subscribing,
    Backoff,
    Polling,
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WatcherState::Idle => "idle",
            WatcherState::Subscribing => "subscribing",
            WatcherState::Backoff => "backoff",
            WatcherState::Polling => "polling",
        };
        f.write_str(name)
    }
}

pub struct Watcher {
    config: WatcherConfig,
    reader: Arc<dyn ChainReader>,
    crawler: Arc<Crawler>,
    state: watch::Sender<WatcherState>,
}

/// Where the tail currently stands.
struct Progress {
    /// First block not yet committed by a range crawl.
    next: u64,
    /// Highest block considered confirmed at the last head lookup.
    confirmed: Option<u64>,
}

impl Watcher {
    pub fn new(config: WatcherConfig, reader: Arc<dyn ChainReader>, crawler: Arc<Crawler>) -> Self {
        let (state, _) = watch::channel(WatcherState::Idle);
        Self {
            config,
            reader,
            crawler,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WatcherState) {
        debug!("Watcher entering {} state", state);
        self.state.send_replace(state);
    }

    /// Tails the chain from `next_block` until cancelled. Only returns on
    /// cancellation or a non-retryable error.
    pub async fn run(&self, next_block: u64, cancel: &CancellationToken) -> Result<(), IndexerError> {
        let mut progress = Progress {
            next: next_block,
            confirmed: None,
        };

        if self.config.mode == WatchMode::Subscription {
            let mut failures = 0;
            loop {
                self.set_state(WatcherState::Subscribing);
                let err = match self.subscription_session(&mut progress, &mut failures, cancel).await {
                    Err(e) if !e.is_retryable() => return Err(e),
                    Err(e) => e,
                    Ok(()) => IndexerError::Transient("subscription stream ended".into()),
                };

                failures += 1;
                if failures >= self.config.max_subscription_failures {
                    error!(
                        alert = true,
                        "Subscription failed {} times in a row ({}), falling back to polling",
                        failures,
                        err
                    );
                    break;
                }

                let delay = self.config.backoff.delay_for(failures);
                warn!(
                    "Subscription failed ({} of {}): {}, resubscribing in {:?}",
                    failures, self.config.max_subscription_failures, err, delay
                );
                self.set_state(WatcherState::Backoff);
                sleep_or_cancel(delay, cancel).await?;
            }
        }

        self.set_state(WatcherState::Polling);
        info!(
            "Polling for new blocks from {} every {:?}",
            progress.next, self.config.poll_interval
        );
        loop {
            self.tick(&mut progress, cancel).await?;
            sleep_or_cancel(self.config.poll_interval, cancel).await?;
        }
    }

    /// Crawls everything confirmed since the last commit.
    async fn poll_once(
        &self,
        progress: &mut Progress,
        cancel: &CancellationToken,
    ) -> Result<(), IndexerError> {
        let head = self.reader.head_block_number().await?;
        // Nothing is confirmed while the chain is shorter than K
        let Some(confirmed) = head.checked_sub(self.config.confirmations) else {
            debug!("Head {} is within the unconfirmed window, nothing to crawl", head);
            return Ok(());
        };
        progress.confirmed = Some(confirmed);

        if let Some(range) = BlockRange::new(progress.next, confirmed) {
            self.crawler.crawl(range, cancel).await?;
            progress.next = confirmed + 1;
        }
        Ok(())
    }

    /// `poll_once`, tolerating lookup failures until the next tick.
    async fn tick(
        &self,
        progress: &mut Progress,
        cancel: &CancellationToken,
    ) -> Result<(), IndexerError> {
        match self.poll_once(progress, cancel).await {
            Err(e) if !e.is_retryable() => Err(e),
            Err(e) => {
                warn!("Failed to poll for new blocks: {}", e);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    async fn subscription_session(
        &self,
        progress: &mut Progress,
        failures: &mut usize,
        cancel: &CancellationToken,
    ) -> Result<(), IndexerError> {
        let target = *self.crawler.processor().target();
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IndexerError::Cancelled),
            stream = self.reader.subscribe_logs(target.contract_address, target.event.signature_hash()) => stream?,
        };
        info!("Subscribed to {} logs", target);

        // Logs seen on the subscription but not yet confirmed
        let mut pending: BTreeMap<u64, Vec<RawLog>> = BTreeMap::new();

        // Cover whatever landed between the last commit and the subscription
        self.tick(progress, cancel).await?;

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IndexerError::Cancelled),
                _ = ticker.tick() => {
                    // The stream outlived a full interval
                    *failures = 0;
                    self.tick(progress, cancel).await?;
                    self.drain_pending(&mut pending, progress).await?;
                }
                item = stream.next() => {
                    let log = match item {
                        Some(Ok(log)) => log,
                        Some(Err(e)) => return Err(e),
                        None => return Ok(()),
                    };
                    *failures = 0;

                    let Some(block) = log.block_number else {
                        debug!("Ignoring pending log without a block number");
                        continue;
                    };
                    if log.removed {
                        if let Some(logs) = pending.get_mut(&block) {
                            logs.retain(|l| {
                                l.transaction_hash != log.transaction_hash
                                    || l.log_index != log.log_index
                            });
                        }
                        info!("Dropped log in block {} removed by a reorg", block);
                        continue;
                    }

                    pending.entry(block).or_default().push(log);
                    if progress.confirmed.is_some_and(|confirmed| block <= confirmed)
                        && block >= progress.next
                    {
                        // Confirmed but not crawled yet: catch up now
                        self.tick(progress, cancel).await?;
                    }
                    self.drain_pending(&mut pending, progress).await?;
                }
            }
        }
    }

    /// Replays buffered logs whose lower blocks are all committed. Usually
    /// they were stored by the crawl already and come back as duplicates.
    async fn drain_pending(
        &self,
        pending: &mut BTreeMap<u64, Vec<RawLog>>,
        progress: &Progress,
    ) -> Result<(), IndexerError> {
        let processor = self.crawler.processor();
        while let Some(entry) = pending.first_entry() {
            if *entry.key() >= progress.next {
                break;
            }
            for log in entry.remove() {
                match processor.process_log(log).await? {
                    LogOutcome::Duplicate | LogOutcome::Removed => {}
                    outcome => info!("Pushed log not returned by the range query: {:?}", outcome),
                }
            }
        }
        Ok(())
    }
}
