use crate::chain::{ChainReader, LogStream};
use crate::error::IndexerError;
use crate::events::RawLog;
use alloy::providers::fillers::FillProvider;
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{BlockNumberOrTag, Filter, Log};
use alloy::transports::{RpcError, TransportError};
use alloy_primitives::{Address, B256, Bytes};
use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, info, warn};

type AlloyFullProvider = FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::Identity,
        alloy::providers::fillers::JoinFill<
            alloy::providers::fillers::GasFiller,
            alloy::providers::fillers::JoinFill<
                alloy::providers::fillers::BlobGasFiller,
                alloy::providers::fillers::JoinFill<
                    alloy::providers::fillers::NonceFiller,
                    alloy::providers::fillers::ChainIdFiller,
                >,
            >,
        >,
    >,
    alloy::providers::RootProvider,
>;

const INVALID_PARAMS: i64 = -32602;
const METHOD_NOT_FOUND: i64 = -32601;

/// Chain reader over one or more HTTP endpoints, plus an optional websocket
/// endpoint for log subscriptions.
#[derive(Clone)]
pub struct RpcClient {
    providers: Vec<AlloyFullProvider>,
    urls: Vec<String>,
    ws_url: Option<String>,
    current_provider: Arc<AtomicUsize>,
    request_timeout: Duration,
    max_retries: usize,
}

impl RpcClient {
    pub fn new(
        rpc_urls: &[String],
        ws_url: Option<String>,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        if rpc_urls.is_empty() {
            return Err(anyhow::anyhow!("At least one RPC URL must be provided"));
        }

        let mut providers = Vec::new();
        for url in rpc_urls {
            let parsed_url = url
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid RPC URL: {}", url))?;
            let provider: AlloyFullProvider = ProviderBuilder::new().connect_http(parsed_url);
            providers.push(provider);
        }

        Ok(RpcClient {
            providers,
            urls: rpc_urls.to_vec(),
            ws_url,
            current_provider: Arc::new(AtomicUsize::new(0)),
            request_timeout,
            max_retries: 5,
        })
    }

    fn get_provider(&self) -> &AlloyFullProvider {
        let index = self.current_provider.load(Ordering::Relaxed) % self.providers.len();
        &self.providers[index]
    }

    pub fn get_current_url(&self) -> &str {
        let index = self.current_provider.load(Ordering::Relaxed) % self.urls.len();
        &self.urls[index]
    }

    pub fn rotate_provider(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current_provider.store(next, Ordering::Relaxed);

        if self.providers.len() > 1 {
            debug!("Rotating to RPC provider #{}", next);
        }
    }

    fn get_retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(100)
            .factor(2)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.max_retries)
    }

    fn handle_error(&self, error: TransportError) -> IndexerError {
        let current_url = self.get_current_url();
        warn!("RPC error on {}: {}, rotating provider", current_url, error);
        self.rotate_provider();
        classify(error)
    }

    fn handle_timeout(&self) -> IndexerError {
        let current_url = self.get_current_url();
        warn!(
            "Request timeout after {} seconds on {}, rotating provider",
            self.request_timeout.as_secs(),
            current_url
        );
        self.rotate_provider();
        IndexerError::Transient(format!(
            "Request timeout after {} seconds",
            self.request_timeout.as_secs()
        ))
    }

    /// Runs `op` against the current provider, rotating and retrying on
    /// transient failures.
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, IndexerError>
    where
        F: Fn(AlloyFullProvider) -> Fut,
        Fut: std::future::Future<Output = Result<T, TransportError>>,
    {
        RetryIf::spawn(
            self.get_retry_strategy(),
            || {
                let provider = self.get_provider().clone();
                let request = op(provider);
                async move {
                    match timeout(self.request_timeout, request).await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(self.handle_error(e)),
                        Err(_) => Err(self.handle_timeout()),
                    }
                }
            },
            |e: &IndexerError| matches!(e, IndexerError::Transient(_)),
        )
        .await
    }

    async fn get_logs_internal(
        &self,
        from_block: u64,
        to_block: u64,
        contract_address: Address,
        topic0: B256,
    ) -> Result<Result<Vec<Log>, String>, IndexerError> {
        let filter = Filter::new()
            .address(contract_address)
            .event_signature(topic0)
            .from_block(from_block)
            .to_block(to_block);

        RetryIf::spawn(
            self.get_retry_strategy(),
            || {
                let provider = self.get_provider().clone();
                let filter = filter.clone();
                async move {
                    match timeout(self.request_timeout, provider.get_logs(&filter)).await {
                        Ok(Ok(logs)) => Ok(Ok(logs)),
                        Ok(Err(e)) => {
                            let error_str = e.to_string();

                            if error_str.contains("exceeds max results") {
                                debug!(
                                    "Max results exceeded for blocks {}-{}, will split range",
                                    from_block, to_block
                                );
                                // not retried: the caller splits the range instead
                                Ok(Err(error_str))
                            } else {
                                Err(self.handle_error(e))
                            }
                        }
                        Err(_) => Err(self.handle_timeout()),
                    }
                }
            },
            |e: &IndexerError| matches!(e, IndexerError::Transient(_)),
        )
        .await
    }

    fn parse_max_results_error(error_str: &str) -> Option<(u64, u64)> {
        let re = Regex::new(r"retry with the range (\d+)-(\d+)").ok()?;
        let captures = re.captures(error_str)?;

        let from = captures.get(1)?.as_str().parse().ok()?;
        let to = captures.get(2)?.as_str().parse().ok()?;

        Some((from, to))
    }

    pub async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        contract_address: Address,
        topic0: B256,
    ) -> Result<Vec<Log>, IndexerError> {
        let mut all_logs = Vec::new();
        let mut current_from = from_block;

        while current_from <= to_block {
            match self
                .get_logs_internal(current_from, to_block, contract_address, topic0)
                .await?
            {
                Ok(logs) => {
                    all_logs.extend(logs);
                    break;
                }
                Err(error_str) => {
                    let Some((suggested_from, suggested_to)) =
                        Self::parse_max_results_error(&error_str)
                            .filter(|(from, to)| *from == current_from && to >= from)
                    else {
                        return Err(IndexerError::Transient(error_str));
                    };

                    info!(
                        "Hit max results limit for blocks {}-{}, splitting at block {}",
                        current_from, to_block, suggested_to
                    );

                    let logs = self
                        .get_logs_internal(suggested_from, suggested_to, contract_address, topic0)
                        .await?
                        .map_err(IndexerError::Transient)?;

                    all_logs.extend(logs);
                    current_from = suggested_to + 1;
                }
            }
        }

        Ok(all_logs)
    }
}

#[async_trait]
impl ChainReader for RpcClient {
    async fn chain_id(&self) -> Result<u64, IndexerError> {
        self.with_retry(|provider| async move { provider.get_chain_id().await })
            .await
    }

    async fn head_block_number(&self) -> Result<u64, IndexerError> {
        self.with_retry(|provider| async move { provider.get_block_number().await })
            .await
    }

    async fn logs_in_range(
        &self,
        from_block: u64,
        to_block: u64,
        contract: Address,
        event_signature: B256,
    ) -> Result<Vec<RawLog>, IndexerError> {
        let logs = self
            .get_logs(from_block, to_block, contract, event_signature)
            .await?;
        Ok(logs.into_iter().map(RawLog::from).collect())
    }

    async fn subscribe_logs(
        &self,
        contract: Address,
        event_signature: B256,
    ) -> Result<LogStream, IndexerError> {
        let url = self.ws_url.clone().ok_or_else(|| {
            IndexerError::Fatal("no websocket endpoint configured for subscriptions".into())
        })?;

        let provider = timeout(
            self.request_timeout,
            ProviderBuilder::new().connect_ws(WsConnect::new(url.clone())),
        )
        .await
        .map_err(|_| IndexerError::Transient(format!("websocket connect to {url} timed out")))?
        .map_err(classify)?;

        let filter = Filter::new()
            .address(contract)
            .event_signature(event_signature);
        let subscription = provider.subscribe_logs(&filter).await.map_err(classify)?;
        info!("Subscribed to logs of {:?} on {}", contract, url);

        // the stream owns the provider so the websocket stays open while it is polled
        let stream = subscription.into_stream().map(move |log| {
            let _connection = &provider;
            Ok(RawLog::from(log))
        });
        Ok(stream.boxed())
    }

    async fn code_at(&self, address: Address, block_number: u64) -> Result<Bytes, IndexerError> {
        self.with_retry(|provider| async move {
            provider
                .get_code_at(address)
                .block_id(BlockNumberOrTag::Number(block_number).into())
                .await
        })
        .await
    }
}

impl From<Log> for RawLog {
    fn from(log: Log) -> Self {
        RawLog {
            address: log.address(),
            topics: log.topics().to_vec(),
            data: log.data().data.clone(),
            block_number: log.block_number,
            transaction_hash: log.transaction_hash,
            log_index: log.log_index,
            removed: log.removed,
        }
    }
}

/// Splits transport failures into the ones a retry can fix and the ones it cannot.
fn classify(error: TransportError) -> IndexerError {
    match &error {
        RpcError::ErrorResp(payload) if matches!(payload.code, INVALID_PARAMS | METHOD_NOT_FOUND) => {
            IndexerError::Fatal(error.to_string())
        }
        RpcError::UnsupportedFeature(_) | RpcError::SerError(_) => {
            IndexerError::Fatal(error.to_string())
        }
        _ => IndexerError::Transient(error.to_string()),
    }
}
