use crate::coordinator::SyncConfig;
use crate::crawler::CrawlerConfig;
use crate::error::IndexerError;
use crate::events::BridgeEventKind;
use crate::retry::RetryPolicy;
use crate::watcher::WatcherConfig;
use alloy_primitives::Address;
use anyhow::{Context, Result, anyhow};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Ignore the cursor and start over from the genesis height.
    Resync,
    /// Resume right after the cursor.
    Continue,
}

impl SyncMode {
    pub const VARIANTS: [SyncMode; 2] = [SyncMode::Resync, SyncMode::Continue];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Resync => "resync",
            SyncMode::Continue => "continue",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::VARIANTS
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown sync mode '{}', expected resync or continue", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    /// Poll with range queries.
    Filter,
    /// Push subscription over websocket, polling as fallback.
    Subscription,
}

impl WatchMode {
    pub const VARIANTS: [WatchMode; 2] = [WatchMode::Filter, WatchMode::Subscription];

    pub fn as_str(&self) -> &'static str {
        match self {
            WatchMode::Filter => "filter",
            WatchMode::Subscription => "subscription",
        }
    }
}

impl fmt::Display for WatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::VARIANTS
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown watch mode '{}', expected filter or subscription", s))
    }
}

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub src_rpc_urls: Vec<String>,
    pub src_ws_url: Option<String>,
    pub rpc_timeout: Duration,
    pub src_bridge_address: Address,
    pub dest_bridge_address: Option<Address>,
    pub database_url: String,
    pub queue_database_url: String,
    pub block_batch_size: u64,
    pub num_workers: usize,
    pub subscription_backoff: Duration,
    pub max_subscription_failures: usize,
    pub sync_mode: SyncMode,
    pub watch_mode: WatchMode,
    pub num_latest_blocks_to_ignore: u64,
    pub event_name: BridgeEventKind,
    pub target_block_number: Option<u64>,
    pub genesis_block: Option<u64>,
    pub poll_interval: Duration,
    pub retry_max_delay: Duration,
    pub publish_sweep_interval: Duration,
    pub publish_grace_period: Duration,
}

impl IndexerConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let src_rpc_urls: Vec<String> = var("SRC_RPC_URLS")
            .context("SRC_RPC_URLS must be set in .env")?
            .split(',')
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();

        let src_bridge_address = var("SRC_BRIDGE_ADDRESS")
            .context("SRC_BRIDGE_ADDRESS must be set in .env")
            .and_then(|s| {
                Address::from_str(s.trim()).context("Invalid SRC_BRIDGE_ADDRESS format")
            })?;

        let dest_bridge_address = var("DEST_BRIDGE_ADDRESS")
            .map(|s| Address::from_str(s.trim()).context("Invalid DEST_BRIDGE_ADDRESS format"))
            .transpose()?;

        let database_url = var("DATABASE_URL").unwrap_or_else(|| "sqlite:./indexer.db".to_string());
        let queue_database_url = var("QUEUE_DATABASE_URL").unwrap_or_else(|| database_url.clone());

        let sync_mode = var("SYNC_MODE")
            .map(|s| s.parse().map_err(|e: String| anyhow!(e)))
            .transpose()?
            .unwrap_or(SyncMode::Continue);
        let watch_mode = var("WATCH_MODE")
            .map(|s| s.parse().map_err(|e: String| anyhow!(e)))
            .transpose()?
            .unwrap_or(WatchMode::Filter);
        let event_name = var("EVENT_NAME")
            .map(|s| s.parse().map_err(|e: String| anyhow!(e)))
            .transpose()?
            .unwrap_or(BridgeEventKind::MessageSent);

        Ok(IndexerConfig {
            src_rpc_urls,
            src_ws_url: var("SRC_WS_URL"),
            rpc_timeout: Duration::from_secs(parse_or(&var, "ETH_CLIENT_TIMEOUT", 10)?),
            src_bridge_address,
            dest_bridge_address,
            database_url,
            queue_database_url,
            block_batch_size: parse_or(&var, "BLOCK_BATCH_SIZE", 100)?,
            num_workers: parse_or(&var, "NUM_GOROUTINES", 10)?,
            subscription_backoff: Duration::from_secs(parse_or(&var, "SUBSCRIPTION_BACKOFF", 2)?),
            max_subscription_failures: parse_or(&var, "MAX_SUBSCRIPTION_FAILURES", 5)?,
            sync_mode,
            watch_mode,
            num_latest_blocks_to_ignore: parse_or(
                &var,
                "NUM_LATEST_BLOCKS_TO_IGNORE_WHEN_CRAWLING",
                5,
            )?,
            event_name,
            target_block_number: parse_opt(&var, "TARGET_BLOCK_NUMBER")?,
            genesis_block: parse_opt(&var, "GENESIS_BLOCK")?,
            poll_interval: Duration::from_secs(parse_or(&var, "POLL_INTERVAL", 12)?),
            retry_max_delay: Duration::from_secs(parse_or(&var, "RETRY_MAX_DELAY", 30)?),
            publish_sweep_interval: Duration::from_secs(parse_or(
                &var,
                "PUBLISH_SWEEP_INTERVAL",
                30,
            )?),
            publish_grace_period: Duration::from_secs(parse_or(
                &var,
                "PUBLISH_GRACE_PERIOD",
                60,
            )?),
        })
    }

    /// Rejects combinations that cannot run.
    pub fn validate(&self) -> Result<(), IndexerError> {
        let invalid = |msg: String| -> Result<(), IndexerError> {
            Err(IndexerError::Configuration(msg))
        };

        if self.src_rpc_urls.is_empty() {
            return invalid("at least one source RPC URL is required".into());
        }
        if self.block_batch_size == 0 {
            return invalid("BLOCK_BATCH_SIZE must be greater than zero".into());
        }
        if self.num_workers == 0 {
            return invalid("NUM_GOROUTINES must be greater than zero".into());
        }
        if self.max_subscription_failures == 0 {
            return invalid("MAX_SUBSCRIPTION_FAILURES must be greater than zero".into());
        }
        if self.watch_mode == WatchMode::Subscription && self.src_ws_url.is_none() {
            return invalid("subscription watch mode requires SRC_WS_URL".into());
        }
        if let (SyncMode::Resync, Some(genesis), Some(target)) =
            (self.sync_mode, self.genesis_block, self.target_block_number)
        {
            if genesis > target {
                return invalid(format!(
                    "resync from genesis block {} cannot reach target block {}",
                    genesis, target
                ));
            }
        }
        Ok(())
    }

    pub fn crawler_config(&self) -> CrawlerConfig {
        CrawlerConfig {
            batch_size: self.block_batch_size,
            num_workers: self.num_workers,
            retry: RetryPolicy::new(Duration::from_millis(500), self.retry_max_delay),
        }
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            mode: self.watch_mode,
            poll_interval: self.poll_interval,
            backoff: RetryPolicy::new(self.subscription_backoff, self.retry_max_delay),
            max_subscription_failures: self.max_subscription_failures,
            confirmations: self.num_latest_blocks_to_ignore,
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            sync_mode: self.sync_mode,
            target_block_number: self.target_block_number,
            genesis_block: self.genesis_block,
            confirmations: self.num_latest_blocks_to_ignore,
            poll_interval: self.poll_interval,
            head_backoff: self.subscription_backoff,
            publish_sweep_interval: self.publish_sweep_interval,
            publish_grace_period: self.publish_grace_period,
        }
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    Ok(parse_opt(var, name)?.unwrap_or(default))
}

fn parse_opt<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    var(name)
        .map(|s| {
            s.trim()
                .parse()
                .map_err(|e| anyhow!("Invalid {} value '{}': {}", name, s, e))
        })
        .transpose()
}
