use serde::{Deserialize, Serialize};
use std::fmt;

/// Row-level operation carried by a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    /// Maps a Debezium `op` code. Snapshot reads (`r`) count as inserts.
    pub fn from_op(op: &str) -> Option<Self> {
        match op {
            "c" | "r" => Some(ChangeKind::Insert),
            "u" => Some(ChangeKind::Update),
            "d" => Some(ChangeKind::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded change record. Immutable once the source adapter hands it out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    offset: u64,
    key: Vec<u8>,
    value: i64,
    previous_value: Option<i64>,
    kind: ChangeKind,
    timestamp_ms: u64,
}

impl ChangeEvent {
    pub fn new(offset: u64, kind: ChangeKind, value: i64) -> Self {
        Self {
            offset,
            key: Vec::new(),
            value,
            previous_value: None,
            kind,
            timestamp_ms: 0,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = key.into();
        self
    }

    /// Attaches the `before` image value for update/delete events.
    pub fn with_previous_value(mut self, previous: Option<i64>) -> Self {
        self.previous_value = previous;
        self
    }

    pub fn with_timestamp_ms(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn previous_value(&self) -> Option<i64> {
        self.previous_value
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }
}
