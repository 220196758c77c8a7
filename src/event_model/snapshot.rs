use super::aggregate::RunningAggregate;
use serde::{Deserialize, Serialize};

/// Immutable point-in-time copy of the aggregate handed to the sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub sum: i64,
    pub offset: u64,
    pub event_count: u64,
    pub taken_at_ms: u64,
}

impl Snapshot {
    /// Copies the aggregate; `None` until at least one offset has been consumed.
    pub fn capture(aggregate: &RunningAggregate, taken_at_ms: u64) -> Option<Self> {
        aggregate.last_offset.map(|offset| Self {
            sum: aggregate.sum,
            offset,
            event_count: aggregate.event_count,
            taken_at_ms,
        })
    }
}
