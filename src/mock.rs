//! In-process doubles for the chain reader and the queue, plus log builders.

use crate::chain::{ChainReader, LogStream};
use crate::error::IndexerError;
use crate::events::{Message, MessageSent, RawLog};
use crate::queue::{QueueMessage, QueuePublisher};
use alloy::sol_types::SolEvent;
use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Transaction hash shared by all test logs of `block`.
pub fn tx_hash_for_block(block: u64) -> B256 {
    keccak256(block.to_be_bytes())
}

/// A well-formed `MessageSent` log.
pub fn message_sent_log(contract: Address, block: u64, log_index: u64, id: u64) -> RawLog {
    let event = MessageSent {
        msgHash: keccak256([block.to_be_bytes(), log_index.to_be_bytes()].concat()),
        message: Message {
            id,
            fee: 10,
            gasLimit: 1_000_000,
            from: Address::repeat_byte(0xaa),
            srcChainId: 167000,
            srcOwner: Address::repeat_byte(0xaa),
            destChainId: 1,
            destOwner: Address::repeat_byte(0xbb),
            to: Address::repeat_byte(0xbb),
            value: U256::from(1_000_000_000_000_000u64),
            data: Bytes::new(),
        },
    };
    let data = event.encode_log_data();

    RawLog {
        address: contract,
        topics: data.topics().to_vec(),
        data: data.data,
        block_number: Some(block),
        transaction_hash: Some(tx_hash_for_block(block)),
        log_index: Some(log_index),
        removed: false,
    }
}

/// A log with the `MessageSent` signature whose data cannot be decoded.
pub fn malformed_log(contract: Address, block: u64, log_index: u64) -> RawLog {
    RawLog {
        address: contract,
        topics: vec![MessageSent::SIGNATURE_HASH, B256::repeat_byte(0x01)],
        data: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
        block_number: Some(block),
        transaction_hash: Some(tx_hash_for_block(block)),
        log_index: Some(log_index),
        removed: false,
    }
}

/// How [`MockChainReader::subscribe_logs`] behaves.
pub enum SubscriptionMode {
    /// Every attempt is refused.
    AlwaysFail,
    /// Attempts succeed and deliver whatever is sent on the feed.
    Feed,
    /// Attempts succeed but the stream errors straight away.
    Disconnect,
}

/// Scripted chain: logs keyed by block, a movable head, injectable failures.
pub struct MockChainReader {
    chain_id: u64,
    head: AtomicU64,
    logs: Mutex<BTreeMap<u64, Vec<RawLog>>>,
    calls: Mutex<Vec<(u64, u64)>>,
    failures: Mutex<HashMap<u64, usize>>,
    delays: Mutex<HashMap<u64, Duration>>,
    head_failures: AtomicUsize,
    subscription: Mutex<SubscriptionMode>,
    feed: Mutex<Option<mpsc::UnboundedReceiver<Result<RawLog, IndexerError>>>>,
    subscribe_attempts: AtomicUsize,
    deployed_at: AtomicU64,
}

impl MockChainReader {
    pub fn new(chain_id: u64, head: u64) -> Self {
        Self {
            chain_id,
            head: AtomicU64::new(head),
            logs: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            head_failures: AtomicUsize::new(0),
            subscription: Mutex::new(SubscriptionMode::AlwaysFail),
            feed: Mutex::new(None),
            subscribe_attempts: AtomicUsize::new(0),
            deployed_at: AtomicU64::new(0),
        }
    }

    pub fn add_log(&self, log: RawLog) {
        let block = log.block_number.unwrap_or_default();
        self.logs.lock().unwrap().entry(block).or_default().push(log);
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// The next `times` fetches of the range starting at `from_block` fail.
    pub fn fail_range(&self, from_block: u64, times: usize) {
        self.failures.lock().unwrap().insert(from_block, times);
    }

    /// Fetches of the range starting at `from_block` take `delay`.
    pub fn delay_range(&self, from_block: u64, delay: Duration) {
        self.delays.lock().unwrap().insert(from_block, delay);
    }

    pub fn fail_head_lookups(&self, times: usize) {
        self.head_failures.store(times, Ordering::SeqCst);
    }

    pub fn set_deployment_block(&self, block: u64) {
        self.deployed_at.store(block, Ordering::SeqCst);
    }

    /// Switches subscriptions to [`SubscriptionMode::Feed`] and returns the
    /// sender that drives them. Dropping the sender ends the stream.
    pub fn feed_subscription(&self) -> mpsc::UnboundedSender<Result<RawLog, IndexerError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.subscription.lock().unwrap() = SubscriptionMode::Feed;
        *self.feed.lock().unwrap() = Some(rx);
        tx
    }

    /// Subscriptions connect and then drop immediately.
    pub fn disconnect_subscriptions(&self) {
        *self.subscription.lock().unwrap() = SubscriptionMode::Disconnect;
    }

    /// Every `(from, to)` passed to `logs_in_range`, in call order.
    pub fn calls(&self) -> Vec<(u64, u64)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn subscribe_attempts(&self) -> usize {
        self.subscribe_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainReader for MockChainReader {
    async fn chain_id(&self) -> Result<u64, IndexerError> {
        Ok(self.chain_id)
    }

    async fn head_block_number(&self) -> Result<u64, IndexerError> {
        let remaining = self.head_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.head_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(IndexerError::Transient("head lookup timed out".into()));
        }
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn logs_in_range(
        &self,
        from_block: u64,
        to_block: u64,
        contract: Address,
        event_signature: B256,
    ) -> Result<Vec<RawLog>, IndexerError> {
        let delay = self.delays.lock().unwrap().get(&from_block).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&from_block) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(IndexerError::Transient(format!(
                        "eth_getLogs {from_block}-{to_block} timed out"
                    )));
                }
            }
        }

        self.calls.lock().unwrap().push((from_block, to_block));
        let logs = self.logs.lock().unwrap();
        Ok(logs
            .range(from_block..=to_block)
            .flat_map(|(_, logs)| logs.iter())
            .filter(|log| {
                log.address == contract && log.topics.first() == Some(&event_signature)
            })
            .cloned()
            .collect())
    }

    async fn subscribe_logs(
        &self,
        _contract: Address,
        _event_signature: B256,
    ) -> Result<LogStream, IndexerError> {
        self.subscribe_attempts.fetch_add(1, Ordering::SeqCst);
        match *self.subscription.lock().unwrap() {
            SubscriptionMode::AlwaysFail => {
                Err(IndexerError::Transient("websocket handshake failed".into()))
            }
            SubscriptionMode::Feed => {
                let rx = self
                    .feed
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or_else(|| IndexerError::Transient("feed already consumed".into()))?;
                let stream = futures::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                });
                Ok(stream.boxed())
            }
            SubscriptionMode::Disconnect => Ok(futures::stream::iter([Err(
                IndexerError::Transient("websocket closed by peer".into()),
            )])
            .boxed()),
        }
    }

    async fn code_at(&self, _address: Address, block_number: u64) -> Result<Bytes, IndexerError> {
        if block_number >= self.deployed_at.load(Ordering::SeqCst) {
            Ok(Bytes::from_static(&[0x60, 0x80, 0x60, 0x40]))
        } else {
            Ok(Bytes::new())
        }
    }
}

/// Queue that keeps published messages in memory.
#[derive(Default)]
pub struct MockQueue {
    published: Mutex<Vec<QueueMessage>>,
    fail_remaining: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl MockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `times` publishes fail.
    pub fn fail_next(&self, times: usize) {
        self.fail_remaining.store(times, Ordering::SeqCst);
    }

    /// Every publish takes `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn published(&self) -> Vec<QueueMessage> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueuePublisher for MockQueue {
    async fn publish(&self, message: &QueueMessage) -> Result<(), IndexerError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(IndexerError::Transient("broker unavailable".into()));
        }
        self.published.lock().unwrap().push(message.clone());
        Ok(())
    }
}
