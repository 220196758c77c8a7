//! Commit coordinator: turns timer ticks into snapshots and dispatch reports
//! into checkpoints.
//!
//! State machine `Idle → Snapshotting → Dispatching → Idle`. At most one
//! snapshot is outstanding; ticks that fire while it is in flight are merged
//! into the next one instead of queueing.

use crate::event_model::aggregate::RunningAggregate;
use crate::event_model::checkpoint::OffsetCheckpoint;
use crate::event_model::snapshot::Snapshot;
use crate::sink::dispatcher::DispatchReport;
use serde::{Deserialize, Serialize};

/// Default commit tick, matching the 100 ms autocommit cadence of the deployment.
pub const DEFAULT_COMMIT_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Snapshotting,
    Dispatching,
}

/// What to do on a tick when no offset was consumed since the last snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnchangedTickPolicy {
    #[default]
    Skip,
    /// Re-send the unchanged snapshot; sinks treat it as a no-op.
    Reemit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    /// Hand this snapshot to the dispatcher.
    Dispatch(Snapshot),
    /// A snapshot is still in flight; this tick folds into the next one.
    Merged,
    Unchanged,
    /// Nothing consumed yet.
    Empty,
}

#[derive(Debug, Clone)]
pub struct CommitCoordinator {
    state: CoordinatorState,
    policy: UnchangedTickPolicy,
    last_taken: Option<u64>,
    in_flight: Option<Snapshot>,
    retry_pending: bool,
    unpersisted: Option<OffsetCheckpoint>,
}

impl CommitCoordinator {
    pub fn new(policy: UnchangedTickPolicy) -> Self {
        Self {
            state: CoordinatorState::Idle,
            policy,
            last_taken: None,
            in_flight: None,
            retry_pending: false,
            unpersisted: None,
        }
    }

    /// Starts as if the checkpointed snapshot had just been committed.
    pub fn resume_from(checkpoint: &OffsetCheckpoint, policy: UnchangedTickPolicy) -> Self {
        Self {
            last_taken: Some(checkpoint.offset),
            ..Self::new(policy)
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn in_flight(&self) -> Option<&Snapshot> {
        self.in_flight.as_ref()
    }

    /// True while some target still owes an acknowledgement for the last snapshot.
    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    pub fn last_snapshot_offset(&self) -> Option<u64> {
        self.last_taken
    }

    /// Checkpoint every target acknowledged that has not been confirmed durable.
    pub fn unpersisted(&self) -> Option<OffsetCheckpoint> {
        self.unpersisted
    }

    /// Clears the pending checkpoint once `offset` or a later one is durable.
    pub fn confirm_persisted(&mut self, offset: u64) {
        if self.unpersisted.is_some_and(|pending| pending.offset <= offset) {
            self.unpersisted = None;
        }
    }

    /// Forces the next tick to dispatch even if nothing new was consumed.
    /// Used when a target rejoins and must catch up on the current state.
    pub fn request_reemit(&mut self) {
        self.retry_pending = true;
    }

    pub fn on_tick(&mut self, aggregate: RunningAggregate, now_ms: u64) -> TickDecision {
        if self.state == CoordinatorState::Dispatching {
            return TickDecision::Merged;
        }
        let Some(offset) = aggregate.last_offset else {
            return TickDecision::Empty;
        };
        let advanced = self.last_taken.map_or(true, |taken| offset > taken);
        if !advanced && !self.retry_pending && self.policy == UnchangedTickPolicy::Skip {
            return TickDecision::Unchanged;
        }
        self.state = CoordinatorState::Snapshotting;
        let Some(snapshot) = Snapshot::capture(&aggregate, now_ms) else {
            self.state = CoordinatorState::Idle;
            return TickDecision::Empty;
        };
        self.in_flight = Some(snapshot);
        self.last_taken = Some(offset);
        self.state = CoordinatorState::Dispatching;
        TickDecision::Dispatch(snapshot)
    }

    /// Completes the in-flight snapshot. Returns the checkpoint to persist when
    /// every target acknowledged it; it stays pending until [`Self::confirm_persisted`].
    pub fn on_dispatched(&mut self, report: &DispatchReport, now_ms: u64) -> Option<OffsetCheckpoint> {
        self.state = CoordinatorState::Idle;
        self.in_flight = None;
        if report.is_committed() {
            self.retry_pending = false;
            let checkpoint = OffsetCheckpoint::from_snapshot(&report.snapshot, now_ms);
            if self.unpersisted.map_or(true, |pending| pending.offset <= checkpoint.offset) {
                self.unpersisted = Some(checkpoint);
            }
            Some(checkpoint)
        } else {
            self.retry_pending = true;
            None
        }
    }

    /// Forgets the in-flight snapshot without a report (forced shutdown or lost hand-off).
    pub fn abandon_in_flight(&mut self) -> Option<Snapshot> {
        self.state = CoordinatorState::Idle;
        let abandoned = self.in_flight.take();
        if abandoned.is_some() {
            self.retry_pending = true;
        }
        abandoned
    }
}

impl Default for CommitCoordinator {
    fn default() -> Self {
        Self::new(UnchangedTickPolicy::default())
    }
}
