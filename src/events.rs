use crate::error::DecodeError;
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy_primitives::{Address, B256, Bytes};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;

sol! {
    #[derive(Debug)]
    struct Message {
        uint64 id;
        uint64 fee;
        uint32 gasLimit;
        address from;
        uint64 srcChainId;
        address srcOwner;
        uint64 destChainId;
        address destOwner;
        address to;
        uint256 value;
        bytes data;
    }

    #[derive(Debug)]
    event MessageSent(bytes32 indexed msgHash, Message message);

    #[derive(Debug)]
    event MessageStatusChanged(bytes32 indexed msgHash, uint8 status);
}

/// Bridge events the indexer knows how to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BridgeEventKind {
    MessageSent,
    MessageStatusChanged,
}

impl BridgeEventKind {
    pub const VARIANTS: &'static [&'static str] = &["MessageSent", "MessageStatusChanged"];

    pub fn name(&self) -> &'static str {
        match self {
            BridgeEventKind::MessageSent => "MessageSent",
            BridgeEventKind::MessageStatusChanged => "MessageStatusChanged",
        }
    }

    /// topic0 of the event.
    pub fn signature_hash(&self) -> B256 {
        match self {
            BridgeEventKind::MessageSent => MessageSent::SIGNATURE_HASH,
            BridgeEventKind::MessageStatusChanged => MessageStatusChanged::SIGNATURE_HASH,
        }
    }
}

impl fmt::Display for BridgeEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BridgeEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MessageSent" => Ok(BridgeEventKind::MessageSent),
            "MessageStatusChanged" => Ok(BridgeEventKind::MessageStatusChanged),
            other => Err(format!(
                "unknown event name {other:?}, expected one of {:?}",
                Self::VARIANTS
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    New,
    Queued,
    Suspended,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::New => "new",
            EventStatus::Queued => "queued",
            EventStatus::Suspended => "suspended",
        }
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(EventStatus::New),
            "queued" => Ok(EventStatus::Queued),
            "suspended" => Ok(EventStatus::Suspended),
            other => Err(format!("unknown event status {other:?}")),
        }
    }
}

/// Identity of one on-chain event occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub src_chain_id: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{:?}:{}",
            self.src_chain_id, self.transaction_hash, self.log_index
        )
    }
}

/// A log as returned by the chain reader, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<B256>,
    pub log_index: Option<u64>,
    pub removed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub src_chain_id: u64,
    pub dest_chain_id: Option<u64>,
    pub contract_address: Address,
    pub name: BridgeEventKind,
    pub msg_hash: B256,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
    pub payload: Value,
    pub status: EventStatus,
}

impl Event {
    pub fn key(&self) -> EventKey {
        EventKey {
            src_chain_id: self.src_chain_id,
            transaction_hash: self.transaction_hash,
            log_index: self.log_index,
        }
    }
}

/// A log that could not be decoded. Recorded so that skipping it is never silent.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeFailure {
    pub src_chain_id: u64,
    pub contract_address: Address,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<B256>,
    pub log_index: Option<u64>,
    pub reason: String,
    pub data: Bytes,
}

impl DecodeFailure {
    pub fn new(src_chain_id: u64, log: &RawLog, error: &DecodeError) -> Self {
        Self {
            src_chain_id,
            contract_address: log.address,
            block_number: log.block_number,
            transaction_hash: log.transaction_hash,
            log_index: log.log_index,
            reason: error.to_string(),
            data: log.data.clone(),
        }
    }
}

/// Decodes `log` as `kind` into a fresh event with status `new`.
pub fn decode_event(
    kind: BridgeEventKind,
    src_chain_id: u64,
    log: &RawLog,
) -> Result<Event, DecodeError> {
    let block_number = log
        .block_number
        .ok_or(DecodeError::MissingField("block number"))?;
    let transaction_hash = log
        .transaction_hash
        .ok_or(DecodeError::MissingField("transaction hash"))?;
    let log_index = log.log_index.ok_or(DecodeError::MissingField("log index"))?;

    match log.topics.first() {
        Some(topic0) if *topic0 == kind.signature_hash() => {}
        Some(topic0) => return Err(DecodeError::UnexpectedSignature(format!("{topic0:?}"))),
        None => return Err(DecodeError::MissingField("topic0")),
    }

    let (msg_hash, dest_chain_id, payload) = match kind {
        BridgeEventKind::MessageSent => {
            let decoded = MessageSent::decode_raw_log(log.topics.as_slice(), &log.data)
                .map_err(|e| DecodeError::Abi(e.to_string()))?;
            let dest = decoded.message.destChainId;
            let payload = json!({
                "msgHash": format!("{:?}", decoded.msgHash),
                "message": message_json(&decoded.message),
            });
            (decoded.msgHash, Some(dest), payload)
        }
        BridgeEventKind::MessageStatusChanged => {
            let decoded = MessageStatusChanged::decode_raw_log(log.topics.as_slice(), &log.data)
                .map_err(|e| DecodeError::Abi(e.to_string()))?;
            let payload = json!({
                "msgHash": format!("{:?}", decoded.msgHash),
                "status": decoded.status,
            });
            (decoded.msgHash, None, payload)
        }
    };

    Ok(Event {
        src_chain_id,
        dest_chain_id,
        contract_address: log.address,
        name: kind,
        msg_hash,
        block_number,
        transaction_hash,
        log_index,
        payload,
        status: EventStatus::New,
    })
}

fn message_json(message: &Message) -> Value {
    json!({
        "id": message.id,
        "fee": message.fee,
        "gasLimit": message.gasLimit,
        "from": format!("{:?}", message.from),
        "srcChainId": message.srcChainId,
        "srcOwner": format!("{:?}", message.srcOwner),
        "destChainId": message.destChainId,
        "destOwner": format!("{:?}", message.destOwner),
        "to": format!("{:?}", message.to),
        "value": message.value.to_string(),
        "data": message.data.to_string(),
    })
}
