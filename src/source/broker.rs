use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// One record as delivered by the broker, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub offset: u64,
    pub key: Option<Vec<u8>>,
    /// `None` for tombstones.
    pub value: Option<Vec<u8>>,
    pub timestamp_ms: Option<u64>,
}

/// Where a fresh session starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Earliest,
    Latest,
    /// Strictly after the given offset.
    After(u64),
}

/// Policy used when no checkpoint exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }

    pub fn start_position(self) -> StartPosition {
        match self {
            OffsetReset::Earliest => StartPosition::Earliest,
            OffsetReset::Latest => StartPosition::Latest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
}

impl SecurityProtocol {
    pub fn scheme(self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "http",
            SecurityProtocol::Ssl => "https",
        }
    }
}

/// Consumer identity and topic for one pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub group_id: String,
    pub session_timeout: Duration,
    pub offset_reset: OffsetReset,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("no broker endpoints configured")]
    NoEndpoints,
    #[error("broker {endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },
    #[error("broker rejected subscription to {topic}: {reason}")]
    Rejected { topic: String, reason: String },
    #[error("broker connect gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("broker connect cancelled")]
    Cancelled,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Session expired or the group rebalanced away from this consumer.
    #[error("broker session lost: {0}")]
    SessionLost(String),
    #[error("broker transport failure: {0}")]
    Transport(String),
}

/// Factory for consumer sessions.
pub trait Broker: Send {
    fn connect(&mut self, subscription: &Subscription) -> Result<Box<dyn BrokerSession>, ConnectError>;
}

/// Single consumer bound to partition 0 of the subscribed topic.
pub trait BrokerSession: Send {
    fn seek(&mut self, position: StartPosition) -> Result<(), FetchError>;

    /// Blocks up to `max_wait`; an empty batch means nothing arrived.
    fn fetch(&mut self, max_wait: Duration) -> Result<Vec<RawRecord>, FetchError>;

    /// Commits the group position; `next_offset` is the first offset not yet durable.
    fn commit(&mut self, next_offset: u64) -> Result<(), FetchError>;

    fn close(self: Box<Self>);
}
