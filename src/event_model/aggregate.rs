//! Incremental reduction of the change stream into a single running sum.
//!
//! The reducer is owned by the ingest activity and is the only writer of the
//! aggregate. Other activities observe copies published after each step.

use super::change_event::{ChangeEvent, ChangeKind};
use super::checkpoint::OffsetCheckpoint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Folded state of every event consumed so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunningAggregate {
    pub sum: i64,
    /// Events that contributed to `sum`; tombstones and undecodable records excluded.
    pub event_count: u64,
    /// Highest offset consumed, including records skipped without business effect.
    pub last_offset: Option<u64>,
}

impl RunningAggregate {
    /// Seeds the aggregate from a durable checkpoint.
    pub fn from_checkpoint(checkpoint: &OffsetCheckpoint) -> Self {
        Self {
            sum: checkpoint.sum,
            event_count: checkpoint.event_count,
            last_offset: Some(checkpoint.offset),
        }
    }

    /// Pure step: the aggregate after `event`, or `None` if the sum would overflow.
    pub fn folded(&self, event: &ChangeEvent, policy: AggregationPolicy) -> Option<Self> {
        let delta = policy.contribution(event)?;
        Some(Self {
            sum: self.sum.checked_add(delta)?,
            event_count: self.event_count.saturating_add(1),
            last_offset: Some(event.offset()),
        })
    }
}

/// How each change kind contributes to the sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Every event adds its `value`, whatever its kind.
    #[default]
    Additive,
    /// Inserts add, deletes subtract, updates add the delta against the `before` image.
    Retracting,
}

impl AggregationPolicy {
    pub fn contribution(self, event: &ChangeEvent) -> Option<i64> {
        match (self, event.kind()) {
            (AggregationPolicy::Additive, _) | (AggregationPolicy::Retracting, ChangeKind::Insert) => {
                Some(event.value())
            }
            (AggregationPolicy::Retracting, ChangeKind::Update) => event
                .value()
                .checked_sub(event.previous_value().unwrap_or(0)),
            (AggregationPolicy::Retracting, ChangeKind::Delete) => event.value().checked_neg(),
        }
    }
}

/// Result of feeding one offset to the reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The event changed the aggregate.
    Applied,
    /// The offset was consumed without touching the sum (tombstone or undecodable record).
    Skipped,
    /// The offset was already reflected in the aggregate and was ignored.
    Replayed,
}

/// Offset gap that no checkpoint resume explains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("offset gap: expected {expected}, received {received}")]
pub struct OutOfOrderError {
    pub expected: u64,
    pub received: u64,
}

/// Failures that stop the reducer from accepting further events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReduceError {
    #[error(transparent)]
    OutOfOrder(#[from] OutOfOrderError),
    #[error("sum overflow while applying offset {offset}")]
    Overflow { offset: u64 },
}

/// Owner of the running aggregate; applies events strictly in offset order.
#[derive(Debug, Clone)]
pub struct IncrementalReducer {
    aggregate: RunningAggregate,
    policy: AggregationPolicy,
    gap_tolerated: bool,
}

impl IncrementalReducer {
    /// Starts from an empty aggregate; the first offset seen is accepted as-is.
    pub fn new(policy: AggregationPolicy) -> Self {
        Self {
            aggregate: RunningAggregate::default(),
            policy,
            gap_tolerated: true,
        }
    }

    /// Re-seeds from a checkpoint. The first event after it may leave a gap
    /// (retention or compaction on the broker); later ones may not.
    pub fn resume_from(checkpoint: &OffsetCheckpoint, policy: AggregationPolicy) -> Self {
        Self {
            aggregate: RunningAggregate::from_checkpoint(checkpoint),
            policy,
            gap_tolerated: true,
        }
    }

    pub fn aggregate(&self) -> RunningAggregate {
        self.aggregate
    }

    pub fn policy(&self) -> AggregationPolicy {
        self.policy
    }

    /// Folds one event into the aggregate.
    pub fn apply(&mut self, event: &ChangeEvent) -> Result<ApplyOutcome, ReduceError> {
        if !self.admit(event.offset())? {
            return Ok(ApplyOutcome::Replayed);
        }
        let next = self
            .aggregate
            .folded(event, self.policy)
            .ok_or(ReduceError::Overflow {
                offset: event.offset(),
            })?;
        self.aggregate = next;
        self.gap_tolerated = false;
        Ok(ApplyOutcome::Applied)
    }

    /// Marks an offset as consumed without changing the sum.
    pub fn skip(&mut self, offset: u64) -> Result<ApplyOutcome, ReduceError> {
        if !self.admit(offset)? {
            return Ok(ApplyOutcome::Replayed);
        }
        self.aggregate.last_offset = Some(offset);
        self.gap_tolerated = false;
        Ok(ApplyOutcome::Skipped)
    }

    /// Returns `Ok(false)` for offsets already folded in.
    fn admit(&self, offset: u64) -> Result<bool, OutOfOrderError> {
        let Some(last) = self.aggregate.last_offset else {
            return Ok(true);
        };
        if offset <= last {
            return Ok(false);
        }
        let expected = last.saturating_add(1);
        if offset == expected || self.gap_tolerated {
            return Ok(true);
        }
        Err(OutOfOrderError {
            expected,
            received: offset,
        })
    }
}
