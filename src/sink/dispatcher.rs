//! Fan-out of committed snapshots to every sink target.
//!
//! Each target tracks the highest offset it acknowledged. A snapshot is
//! written only to targets behind it, in parallel, each with its own retry
//! budget. Targets that exhaust their budget stay behind and are retried with
//! the next snapshot; a snapshot counts as committed once every target that is
//! not administratively skipped has acknowledged its offset.

use super::{SinkKind, SnapshotSink, WriteAck};
use crate::event_model::snapshot::Snapshot;
use crate::observability::health::PipelineHealth;
use crate::observability::logging::{LogLevel, Logger};
use crate::observability::metrics::PipelineMetrics;
use crate::runtime::lock;
use crate::runtime::retry::{RetryError, RetryPolicy};
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread;
use thiserror::Error;

/// Targets an operator has excluded from checkpoint gating.
#[derive(Debug, Clone, Default)]
pub struct SkipList {
    ids: Arc<Mutex<BTreeSet<String>>>,
}

impl SkipList {
    /// Returns false if the target was already skipped.
    pub fn skip(&self, id: &str) -> bool {
        lock(&self.ids).insert(id.to_string())
    }

    /// Returns false if the target was not skipped.
    pub fn unskip(&self, id: &str) -> bool {
        lock(&self.ids).remove(id)
    }

    pub fn is_skipped(&self, id: &str) -> bool {
        lock(&self.ids).contains(id)
    }

    pub fn ids(&self) -> Vec<String> {
        lock(&self.ids).iter().cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    Acked { ack: WriteAck, attempts: u32 },
    /// Already acknowledged this offset or a later one.
    AlreadyCurrent,
    Skipped,
    Failed { attempts: u32, error: String },
    Cancelled,
}

impl TargetOutcome {
    /// Whether the outcome lets the checkpoint advance.
    pub fn permits_commit(&self) -> bool {
        matches!(
            self,
            TargetOutcome::Acked { .. } | TargetOutcome::AlreadyCurrent | TargetOutcome::Skipped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetReport {
    pub id: String,
    pub kind: SinkKind,
    pub outcome: TargetOutcome,
}

/// Per-target results of dispatching one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub snapshot: Snapshot,
    pub targets: Vec<TargetReport>,
}

impl DispatchReport {
    pub fn is_committed(&self) -> bool {
        self.targets.iter().all(|t| t.outcome.permits_commit())
    }

    pub fn stalled_targets(&self) -> Vec<&str> {
        self.targets
            .iter()
            .filter(|t| matches!(t.outcome, TargetOutcome::Failed { .. }))
            .map(|t| t.id.as_str())
            .collect()
    }

    pub fn target(&self, id: &str) -> Option<&TargetReport> {
        self.targets.iter().find(|t| t.id == id)
    }

    pub fn result(&self) -> Result<(), DispatchError> {
        if self.is_committed() {
            return Ok(());
        }
        if self
            .targets
            .iter()
            .any(|t| t.outcome == TargetOutcome::Cancelled)
        {
            return Err(DispatchError::Cancelled {
                offset: self.snapshot.offset,
            });
        }
        Err(DispatchError::TargetsStalled {
            offset: self.snapshot.offset,
            targets: self.stalled_targets().into_iter().map(str::to_string).collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("snapshot at offset {offset} not acknowledged by {targets:?}")]
    TargetsStalled { offset: u64, targets: Vec<String> },
    #[error("dispatch of snapshot at offset {offset} was cancelled")]
    Cancelled { offset: u64 },
}

struct TargetSlot {
    id: String,
    kind: SinkKind,
    sink: Box<dyn SnapshotSink>,
    acked: Option<u64>,
}

/// Writes snapshots to every target, one snapshot at a time.
pub struct SinkDispatcher {
    slots: Vec<TargetSlot>,
    retry: RetryPolicy,
    skipped: SkipList,
    cancel: Arc<AtomicBool>,
    metrics: Arc<PipelineMetrics>,
    health: Arc<PipelineHealth>,
    logger: Logger,
}

impl SinkDispatcher {
    pub fn new(
        sinks: Vec<Box<dyn SnapshotSink>>,
        retry: RetryPolicy,
        metrics: Arc<PipelineMetrics>,
        health: Arc<PipelineHealth>,
        logger: Logger,
    ) -> Self {
        let slots = sinks
            .into_iter()
            .map(|sink| TargetSlot {
                id: sink.id().to_string(),
                kind: sink.kind(),
                sink,
                acked: None,
            })
            .collect();
        Self {
            slots,
            retry,
            skipped: SkipList::default(),
            cancel: Arc::new(AtomicBool::new(false)),
            metrics,
            health,
            logger: logger.scoped("sink"),
        }
    }

    /// Shares a skip list with the pipeline handle.
    pub fn with_skip_list(mut self, skipped: SkipList) -> Self {
        self.skipped = skipped;
        self
    }

    /// Raising the flag interrupts retry backoff; in-flight writes finish.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn skip_list(&self) -> SkipList {
        self.skipped.clone()
    }

    pub fn target_ids(&self) -> Vec<String> {
        self.slots.iter().map(|slot| slot.id.clone()).collect()
    }

    pub fn acked_offset(&self, id: &str) -> Option<u64> {
        self.slots
            .iter()
            .find(|slot| slot.id == id)
            .and_then(|slot| slot.acked)
    }

    /// Writes `snapshot` to every lagging target and reports per-target outcomes.
    pub fn dispatch(&mut self, snapshot: &Snapshot) -> DispatchReport {
        let retry = self.retry;
        let cancel = &*self.cancel;
        let skipped = &self.skipped;
        let slots = &mut self.slots;
        let targets = thread::scope(|scope| {
            let mut pending = Vec::with_capacity(slots.len());
            for TargetSlot {
                id,
                kind,
                sink,
                acked,
            } in slots.iter_mut()
            {
                let state = if skipped.is_skipped(id) {
                    Pending::Ready(TargetOutcome::Skipped)
                } else if acked.is_some_and(|offset| offset >= snapshot.offset) {
                    Pending::Ready(TargetOutcome::AlreadyCurrent)
                } else {
                    let spawned = thread::Builder::new()
                        .name(format!("tallyline_sink_{id}"))
                        .spawn_scoped(scope, move || {
                            write_with_retry(sink.as_mut(), snapshot, retry, cancel)
                        });
                    match spawned {
                        Ok(handle) => Pending::Running(handle),
                        Err(err) => Pending::Ready(TargetOutcome::Failed {
                            attempts: 0,
                            error: format!("failed to spawn writer: {err}"),
                        }),
                    }
                };
                pending.push((id, *kind, acked, state));
            }
            pending
                .into_iter()
                .map(|(id, kind, acked, state)| {
                    let outcome = match state {
                        Pending::Ready(outcome) => outcome,
                        Pending::Running(handle) => {
                            handle.join().unwrap_or_else(|_| TargetOutcome::Failed {
                                attempts: 0,
                                error: "sink writer panicked".into(),
                            })
                        }
                    };
                    if let TargetOutcome::Acked { .. } = outcome {
                        *acked = Some(snapshot.offset);
                    }
                    TargetReport {
                        id: id.clone(),
                        kind,
                        outcome,
                    }
                })
                .collect::<Vec<_>>()
        });
        let report = DispatchReport {
            snapshot: *snapshot,
            targets,
        };
        self.observe(&report);
        report
    }

    /// Closes every sink.
    pub fn close(&mut self) {
        for slot in &mut self.slots {
            slot.sink.close();
        }
    }

    fn observe(&self, report: &DispatchReport) {
        for target in &report.targets {
            match &target.outcome {
                TargetOutcome::Acked { attempts, .. } => {
                    self.metrics.record_sink_ack(&target.id, report.snapshot.offset);
                    self.health.set_sink_stalled(&target.id, false);
                    if *attempts > 1 {
                        self.logger.log(
                            LogLevel::Info,
                            "dispatcher",
                            Some(report.snapshot.offset),
                            &format!("sink {} recovered after {attempts} attempts", target.id),
                        );
                    }
                }
                TargetOutcome::AlreadyCurrent | TargetOutcome::Skipped => {
                    self.health.set_sink_stalled(&target.id, false);
                }
                TargetOutcome::Failed { attempts, error } => {
                    for _ in 0..*attempts {
                        self.metrics.record_sink_failure(&target.id);
                    }
                    self.health.set_sink_stalled(&target.id, true);
                    self.logger.log(
                        LogLevel::Error,
                        "dispatcher",
                        Some(report.snapshot.offset),
                        &format!(
                            "sink {} stalled after {attempts} attempts: {error}",
                            target.id
                        ),
                    );
                }
                TargetOutcome::Cancelled => {
                    self.logger.log(
                        LogLevel::Warn,
                        "dispatcher",
                        Some(report.snapshot.offset),
                        &format!("write to sink {} abandoned", target.id),
                    );
                }
            }
        }
    }
}

enum Pending<'scope> {
    Ready(TargetOutcome),
    Running(thread::ScopedJoinHandle<'scope, TargetOutcome>),
}

fn write_with_retry(
    sink: &mut dyn SnapshotSink,
    snapshot: &Snapshot,
    retry: RetryPolicy,
    cancel: &AtomicBool,
) -> TargetOutcome {
    match retry.run(cancel, |_| sink.write(snapshot)) {
        Ok(attempted) => TargetOutcome::Acked {
            ack: attempted.value,
            attempts: attempted.attempts,
        },
        Err(RetryError::Exhausted { attempts, last }) => TargetOutcome::Failed {
            attempts,
            error: last.to_string(),
        },
        Err(RetryError::Cancelled { .. }) => TargetOutcome::Cancelled,
    }
}
