//! Wires the source, reducer, coordinator, dispatcher, and offset manager onto
//! three named threads:
//!
//! - `tallyline_ingest` polls the broker and owns the reducer; it publishes the
//!   aggregate after every offset and never waits on sinks.
//! - `tallyline_commit` ticks the coordinator and persists checkpoints.
//! - `tallyline_dispatch` writes snapshots to the sinks.
//!
//! Snapshots travel through a capacity-one hand-off queue; dispatch reports
//! come back through a lock-free bounded queue.

use super::backpressure::BackpressureQueue;
use super::handoff::{handoff, HandoffReceiver, HandoffSender, HandoffSendError, HandoffSignal};
use super::retry::RetryPolicy;
use crate::commit::{CommitCoordinator, TickDecision, UnchangedTickPolicy, DEFAULT_COMMIT_INTERVAL_MS};
use crate::event_model::aggregate::{AggregationPolicy, ApplyOutcome, IncrementalReducer, RunningAggregate};
use crate::event_model::checkpoint::{
    CheckpointLoadError, CheckpointStore, OffsetCheckpoint, OffsetGate, OffsetManager, PersistError,
};
use crate::event_model::clock::{millis, WallClock};
use crate::event_model::snapshot::Snapshot;
use crate::observability::health::{HealthReport, PipelineHealth, CHECKPOINT_NOT_DURABLE_REASON};
use crate::observability::logging::{LogLevel, Logger};
use crate::observability::metrics::PipelineMetrics;
use crate::sink::dispatcher::{DispatchReport, SinkDispatcher, SkipList};
use crate::sink::SnapshotSink;
use crate::source::{Broker, ConnectError, SourceAdapter, SourceItem, SourceOptions, Subscription};
use crossbeam_utils::atomic::AtomicCell;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

const INGEST_POLL_WAIT: Duration = Duration::from_millis(50);
const DISPATCH_IDLE_WAIT: Duration = Duration::from_millis(50);
const COMMIT_IDLE_SLICE: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    CheckpointLoad(#[from] CheckpointLoadError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("pipeline requires at least one sink")]
    NoSinks,
    #[error("unknown sink `{0}`")]
    UnknownSink(String),
    #[error("failed to spawn {thread}: {source}")]
    Spawn {
        thread: &'static str,
        source: io::Error,
    },
    #[error("{0} thread panicked")]
    WorkerPanicked(&'static str),
}

/// Everything the pipeline owns once started.
pub struct PipelineParts {
    pub broker: Box<dyn Broker>,
    pub subscription: Subscription,
    pub sinks: Vec<Box<dyn SnapshotSink>>,
    pub checkpoint_store: Box<dyn CheckpointStore>,
    pub policy: AggregationPolicy,
    pub commit_interval: Duration,
    pub unchanged_ticks: UnchangedTickPolicy,
    pub connect_retry: RetryPolicy,
    pub sink_retry: RetryPolicy,
    pub checkpoint_retry: RetryPolicy,
    pub clock: Arc<dyn WallClock>,
    pub logger: Logger,
}

impl PipelineParts {
    /// Parts with default policies and a 100 ms commit interval.
    pub fn new(
        broker: Box<dyn Broker>,
        subscription: Subscription,
        sinks: Vec<Box<dyn SnapshotSink>>,
        checkpoint_store: Box<dyn CheckpointStore>,
        clock: Arc<dyn WallClock>,
        logger: Logger,
    ) -> Self {
        Self {
            broker,
            subscription,
            sinks,
            checkpoint_store,
            policy: AggregationPolicy::default(),
            commit_interval: Duration::from_millis(DEFAULT_COMMIT_INTERVAL_MS),
            unchanged_ticks: UnchangedTickPolicy::default(),
            connect_retry: RetryPolicy::default(),
            sink_retry: RetryPolicy::default(),
            checkpoint_retry: RetryPolicy::default(),
            clock,
            logger,
        }
    }
}

/// State shared between the activities and the handle.
struct Shared {
    metrics: Arc<PipelineMetrics>,
    health: Arc<PipelineHealth>,
    aggregate: AtomicCell<RunningAggregate>,
    durable: AtomicCell<Option<OffsetCheckpoint>>,
    stop_ingest: AtomicBool,
    ingest_done: AtomicBool,
    halted: AtomicBool,
    /// Raised when a target rejoins; the commit activity re-dispatches current state.
    reemit_requested: AtomicBool,
    abort: Arc<AtomicBool>,
    drain_deadline: AtomicCell<Option<Instant>>,
    clock: Arc<dyn WallClock>,
}

/// Result of the commit activity winding down.
#[derive(Debug, Clone, Copy, Default)]
struct CommitOutcome {
    abandoned: Option<u64>,
}

/// How the pipeline ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub aggregate: RunningAggregate,
    pub final_checkpoint: Option<OffsetCheckpoint>,
    /// Offset of a snapshot whose dispatch was abandoned.
    pub abandoned_offset: Option<u64>,
    pub durable: bool,
}

pub struct Pipeline;

impl Pipeline {
    /// Loads the checkpoint, connects to the broker, and spawns the activities.
    pub fn start(parts: PipelineParts) -> Result<PipelineHandle, PipelineError> {
        if parts.sinks.is_empty() {
            return Err(PipelineError::NoSinks);
        }
        let logger = parts.logger.scoped("pipeline");
        let offsets = OffsetManager::open(parts.checkpoint_store, parts.checkpoint_retry)?;
        let resume = offsets.load();
        let sink_ids: Vec<String> = parts.sinks.iter().map(|s| s.id().to_string()).collect();
        let metrics = Arc::new(PipelineMetrics::new(sink_ids.iter().cloned()));
        let health = Arc::new(PipelineHealth::new());
        let (reducer, coordinator) = match &resume {
            Some(checkpoint) => {
                metrics.record_resumed(checkpoint.offset);
                logger.log(
                    LogLevel::Info,
                    "recovery",
                    Some(checkpoint.offset),
                    &format!("resuming from checkpoint with sum {}", checkpoint.sum),
                );
                (
                    IncrementalReducer::resume_from(checkpoint, parts.policy),
                    CommitCoordinator::resume_from(checkpoint, parts.unchanged_ticks),
                )
            }
            None => {
                logger.info("recovery", "no checkpoint found; starting from the topic reset position");
                (
                    IncrementalReducer::new(parts.policy),
                    CommitCoordinator::new(parts.unchanged_ticks),
                )
            }
        };

        let abort = Arc::new(AtomicBool::new(false));
        let adapter = SourceAdapter::connect(
            parts.broker,
            SourceOptions {
                subscription: parts.subscription,
                resume_after: resume.map(|checkpoint| checkpoint.offset),
                retry: parts.connect_retry,
                clock: Arc::clone(&parts.clock),
                cancel: Arc::clone(&abort),
                logger: parts.logger.clone(),
            },
        )?;

        let shared = Arc::new(Shared {
            metrics: Arc::clone(&metrics),
            health: Arc::clone(&health),
            aggregate: AtomicCell::new(reducer.aggregate()),
            durable: AtomicCell::new(resume),
            stop_ingest: AtomicBool::new(false),
            ingest_done: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            reemit_requested: AtomicBool::new(false),
            abort: Arc::clone(&abort),
            drain_deadline: AtomicCell::new(None),
            clock: Arc::clone(&parts.clock),
        });
        let skipped = SkipList::default();
        let gate = offsets.gate();
        let dispatcher = SinkDispatcher::new(
            parts.sinks,
            parts.sink_retry,
            Arc::clone(&metrics),
            Arc::clone(&health),
            parts.logger.clone(),
        )
        .with_skip_list(skipped.clone())
        .with_cancel(Arc::clone(&abort));
        let (snapshot_tx, snapshot_rx) = handoff(1);
        let reports = BackpressureQueue::dispatch_reports();

        let ingest = spawn("tallyline_ingest", {
            let activity = IngestActivity {
                adapter,
                reducer,
                gate: gate.clone(),
                shared: Arc::clone(&shared),
                logger: parts.logger.scoped("ingest"),
                seen_reconnects: 0,
            };
            move || activity.run()
        })?;
        let commit = spawn("tallyline_commit", {
            let activity = CommitActivity {
                coordinator,
                offsets,
                interval: parts.commit_interval,
                snapshots: snapshot_tx.clone(),
                reports: reports.clone(),
                shared: Arc::clone(&shared),
                logger: parts.logger.scoped("commit"),
            };
            move || activity.run()
        })?;
        let dispatch = spawn("tallyline_dispatch", {
            let activity = DispatchActivity {
                dispatcher,
                snapshots: snapshot_rx,
                reports,
                logger: parts.logger.scoped("dispatch"),
            };
            move || activity.run()
        })?;
        logger.info("lifecycle", "pipeline started");

        Ok(PipelineHandle {
            shared,
            gate,
            skipped,
            sink_ids,
            snapshots: snapshot_tx,
            ingest: Some(ingest),
            commit: Some(commit),
            dispatch: Some(dispatch),
            logger,
        })
    }
}

fn spawn<T, F>(name: &'static str, body: F) -> Result<JoinHandle<T>, PipelineError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|source| PipelineError::Spawn {
            thread: name,
            source,
        })
}

struct IngestActivity {
    adapter: SourceAdapter,
    reducer: IncrementalReducer,
    gate: OffsetGate,
    shared: Arc<Shared>,
    logger: Logger,
    seen_reconnects: u64,
}

impl IngestActivity {
    fn run(mut self) -> SourceAdapter {
        let shared = Arc::clone(&self.shared);
        while !shared.stop_ingest.load(Ordering::Acquire) && !shared.abort.load(Ordering::Acquire) {
            if shared.halted.load(Ordering::Acquire) {
                thread::sleep(INGEST_POLL_WAIT);
            } else {
                match self.adapter.poll(INGEST_POLL_WAIT) {
                    Ok(Some(item)) => self.consume(item),
                    Ok(None) => {}
                    Err(ConnectError::Cancelled) => break,
                    Err(err) => {
                        self.halt("source", None, &format!("source unavailable: {err}"));
                    }
                }
                self.observe_connection();
            }
            if let Err(err) = self.adapter.commit_durable(&self.gate) {
                self.logger.warn("offsets", &format!("broker offset commit failed: {err}"));
            }
        }
        shared.ingest_done.store(true, Ordering::Release);
        self.adapter
    }

    fn consume(&mut self, item: SourceItem) {
        let metrics = &self.shared.metrics;
        let offset = item.offset();
        let outcome = match item {
            SourceItem::Event(event) => self.reducer.apply(&event),
            SourceItem::Tombstone { offset } => {
                metrics.record_tombstone();
                self.reducer.skip(offset)
            }
            SourceItem::Undecodable(err) => {
                metrics.record_decode_error();
                self.logger
                    .log(LogLevel::Warn, "decode", Some(err.offset), &err.to_string());
                self.reducer.skip(err.offset)
            }
        };
        match outcome {
            Ok(ApplyOutcome::Applied) => metrics.record_applied(),
            Ok(ApplyOutcome::Replayed) => metrics.record_replayed(),
            Ok(ApplyOutcome::Skipped) => {}
            Err(err) => {
                self.halt("reducer", Some(offset), &format!("ingestion halted: {err}"));
                return;
            }
        }
        self.shared.aggregate.store(self.reducer.aggregate());
    }

    fn halt(&mut self, component: &str, offset: Option<u64>, message: &str) {
        self.shared.halted.store(true, Ordering::Release);
        self.shared.health.set_ingest_halted(true);
        self.logger.log(LogLevel::Error, component, offset, message);
    }

    fn observe_connection(&mut self) {
        let reconnects = self.adapter.reconnects();
        while self.seen_reconnects < reconnects {
            self.shared.metrics.record_reconnect();
            self.seen_reconnects += 1;
        }
        self.shared
            .health
            .set_source_connected(self.adapter.is_connected());
    }
}

struct CommitActivity {
    coordinator: CommitCoordinator,
    offsets: OffsetManager,
    interval: Duration,
    snapshots: HandoffSender<Snapshot>,
    reports: BackpressureQueue<DispatchReport>,
    shared: Arc<Shared>,
    logger: Logger,
}

impl CommitActivity {
    fn run(mut self) -> CommitOutcome {
        let mut next_tick = Instant::now() + self.interval;
        loop {
            if self.shared.abort.load(Ordering::Acquire) {
                self.snapshots.close();
                return CommitOutcome {
                    abandoned: self.coordinator.abandon_in_flight().map(|s| s.offset),
                };
            }
            self.drain_reports();
            if let Some(deadline) = self.shared.drain_deadline.load() {
                if self.shared.ingest_done.load(Ordering::Acquire) {
                    return self.finish(deadline);
                }
            }
            let now = Instant::now();
            if now >= next_tick {
                self.tick();
                next_tick = now + self.interval;
                continue;
            }
            thread::sleep((next_tick - now).min(COMMIT_IDLE_SLICE));
        }
    }

    /// Graceful end: settle the in-flight snapshot, take a final one, persist, stop the dispatcher.
    fn finish(mut self, deadline: Instant) -> CommitOutcome {
        let mut final_tick_taken = false;
        loop {
            self.drain_reports();
            if self.coordinator.in_flight().is_none() {
                if final_tick_taken {
                    break;
                }
                self.tick();
                final_tick_taken = true;
                continue;
            }
            if Instant::now() >= deadline {
                self.shared.abort.store(true, Ordering::Release);
                let abandoned = self.coordinator.abandon_in_flight().map(|s| s.offset);
                self.retry_unpersisted();
                self.logger.log(
                    LogLevel::Warn,
                    "lifecycle",
                    abandoned,
                    "grace period elapsed; abandoning in-flight snapshot",
                );
                self.snapshots.close();
                return CommitOutcome { abandoned };
            }
            thread::sleep(COMMIT_IDLE_SLICE);
        }
        self.retry_unpersisted();
        self.snapshots.signal_shutdown();
        CommitOutcome::default()
    }

    fn tick(&mut self) {
        self.retry_unpersisted();
        if self.coordinator.in_flight().is_none()
            && self.shared.reemit_requested.swap(false, Ordering::AcqRel)
        {
            self.coordinator.request_reemit();
        }
        let now_ms = self.shared.clock.now_ms();
        match self.coordinator.on_tick(self.shared.aggregate.load(), now_ms) {
            TickDecision::Dispatch(snapshot) => match self.snapshots.try_send(snapshot) {
                Ok(()) => self.shared.metrics.record_snapshot_taken(),
                Err(HandoffSendError::Full(_)) | Err(HandoffSendError::Closed(_)) => {
                    self.coordinator.abandon_in_flight();
                    self.logger.log(
                        LogLevel::Warn,
                        "coordinator",
                        Some(snapshot.offset),
                        "snapshot hand-off refused",
                    );
                }
            },
            TickDecision::Merged => self.shared.metrics.record_tick_merged(),
            TickDecision::Unchanged | TickDecision::Empty => {}
        }
    }

    fn drain_reports(&mut self) {
        while let Some(report) = self.reports.try_dequeue() {
            self.settle(&report);
        }
    }

    fn settle(&mut self, report: &DispatchReport) {
        let now_ms = self.shared.clock.now_ms();
        let Some(checkpoint) = self.coordinator.on_dispatched(report, now_ms) else {
            return;
        };
        if self.persist(checkpoint, LogLevel::Error) {
            self.shared
                .metrics
                .set_commit_lag_ms(now_ms.saturating_sub(report.snapshot.taken_at_ms));
        }
    }

    /// Re-attempts an acknowledged checkpoint whose earlier persist failed.
    fn retry_unpersisted(&mut self) {
        let Some(checkpoint) = self.coordinator.unpersisted() else {
            return;
        };
        if self.persist(checkpoint, LogLevel::Warn) {
            self.logger.log(
                LogLevel::Info,
                "checkpoint",
                Some(checkpoint.offset),
                "checkpoint persisted after earlier failure",
            );
        }
    }

    fn persist(&mut self, checkpoint: OffsetCheckpoint, failure_level: LogLevel) -> bool {
        match self.offsets.persist(checkpoint) {
            Ok(()) => {
                self.coordinator.confirm_persisted(checkpoint.offset);
                self.shared.metrics.record_committed(checkpoint.offset);
                self.shared.durable.store(Some(checkpoint));
                self.shared.health.set_checkpoint_durable(true);
                self.logger.log(
                    LogLevel::Debug,
                    "checkpoint",
                    Some(checkpoint.offset),
                    &format!("checkpoint persisted with sum {}", checkpoint.sum),
                );
                true
            }
            Err(PersistError::Regression { durable, .. }) => {
                // A later checkpoint already landed.
                self.coordinator.confirm_persisted(durable);
                false
            }
            Err(err) => {
                self.shared.metrics.record_persist_failure();
                self.shared
                    .health
                    .set_checkpoint_durable(self.offsets.is_durable());
                self.logger.log(
                    failure_level,
                    "checkpoint",
                    Some(checkpoint.offset),
                    &format!("checkpoint not durable: {err}"),
                );
                false
            }
        }
    }
}

struct DispatchActivity {
    dispatcher: SinkDispatcher,
    snapshots: HandoffReceiver<Snapshot>,
    reports: BackpressureQueue<DispatchReport>,
    logger: Logger,
}

impl DispatchActivity {
    fn run(mut self) {
        loop {
            match self.snapshots.recv_timeout(DISPATCH_IDLE_WAIT) {
                Some(HandoffSignal::Work(snapshot)) => {
                    let report = self.dispatcher.dispatch(&snapshot);
                    if let Err(err) = self.reports.enqueue(report) {
                        self.logger.log(
                            LogLevel::Error,
                            "dispatcher",
                            Some(snapshot.offset),
                            &err.message(),
                        );
                    }
                }
                Some(HandoffSignal::Shutdown) => break,
                None if self.snapshots.is_closed() => break,
                None => {}
            }
        }
        self.dispatcher.close();
    }
}

/// Control surface of a running pipeline.
pub struct PipelineHandle {
    shared: Arc<Shared>,
    gate: OffsetGate,
    skipped: SkipList,
    sink_ids: Vec<String>,
    snapshots: HandoffSender<Snapshot>,
    ingest: Option<JoinHandle<SourceAdapter>>,
    commit: Option<JoinHandle<CommitOutcome>>,
    dispatch: Option<JoinHandle<()>>,
    logger: Logger,
}

impl PipelineHandle {
    pub fn metrics(&self) -> &PipelineMetrics {
        &self.shared.metrics
    }

    pub fn render_metrics(&self) -> String {
        self.shared.metrics.render_metrics()
    }

    pub fn health(&self) -> HealthReport {
        self.shared.health.report()
    }

    /// Latest aggregate published by the ingest activity.
    pub fn aggregate(&self) -> RunningAggregate {
        self.shared.aggregate.load()
    }

    pub fn durable_checkpoint(&self) -> Option<OffsetCheckpoint> {
        self.shared.durable.load()
    }

    /// True once ingestion paused on a structural error.
    pub fn is_halted(&self) -> bool {
        self.shared.halted.load(Ordering::Acquire)
    }

    /// Lets the checkpoint advance without `id` until it is un-skipped.
    pub fn skip_sink(&self, id: &str) -> Result<(), PipelineError> {
        self.known_sink(id)?;
        if self.skipped.skip(id) {
            self.logger
                .warn("admin", &format!("sink {id} skipped; checkpoint no longer waits for it"));
        }
        Ok(())
    }

    pub fn unskip_sink(&self, id: &str) -> Result<(), PipelineError> {
        self.known_sink(id)?;
        if self.skipped.unskip(id) {
            self.shared.reemit_requested.store(true, Ordering::Release);
            self.logger.info("admin", &format!("sink {id} re-included in checkpoint gating"));
        }
        Ok(())
    }

    pub fn skipped_sinks(&self) -> Vec<String> {
        self.skipped.ids()
    }

    /// Stops polling, lets the in-flight snapshot finish within `grace`,
    /// persists the final checkpoint, then releases broker and sinks.
    pub fn shutdown(mut self, grace: Duration) -> Result<ShutdownReport, PipelineError> {
        self.logger.info(
            "lifecycle",
            &format!("graceful shutdown requested (grace {} ms)", millis(grace)),
        );
        self.shared.stop_ingest.store(true, Ordering::Release);
        self.shared
            .drain_deadline
            .store(Some(Instant::now() + grace));
        self.wind_down(true)
    }

    /// Stops immediately, abandoning any in-flight snapshot.
    pub fn abort(mut self) -> Result<ShutdownReport, PipelineError> {
        self.logger.warn("lifecycle", "forced shutdown requested");
        self.raise_abort();
        self.wind_down(false)
    }

    fn raise_abort(&self) {
        self.shared.abort.store(true, Ordering::Release);
        self.shared.stop_ingest.store(true, Ordering::Release);
        self.snapshots.close();
    }

    fn wind_down(&mut self, graceful: bool) -> Result<ShutdownReport, PipelineError> {
        let adapter = join(self.ingest.take(), "ingest")?;
        let outcome = join(self.commit.take(), "commit")?.unwrap_or_default();
        join(self.dispatch.take(), "dispatch")?;
        if let Some(mut adapter) = adapter {
            if graceful {
                if let Err(err) = adapter.commit_durable(&self.gate) {
                    self.logger
                        .warn("offsets", &format!("final broker offset commit failed: {err}"));
                }
            }
            adapter.close();
        }
        let report = ShutdownReport {
            aggregate: self.shared.aggregate.load(),
            final_checkpoint: self.shared.durable.load(),
            abandoned_offset: outcome.abandoned,
            durable: !self
                .shared
                .health
                .report()
                .has_reason(CHECKPOINT_NOT_DURABLE_REASON),
        };
        self.logger.log(
            LogLevel::Info,
            "lifecycle",
            report.final_checkpoint.map(|c| c.offset),
            "pipeline stopped",
        );
        Ok(report)
    }

    fn known_sink(&self, id: &str) -> Result<(), PipelineError> {
        if self.sink_ids.iter().any(|known| known == id) {
            Ok(())
        } else {
            Err(PipelineError::UnknownSink(id.to_string()))
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if self.ingest.is_some() || self.commit.is_some() || self.dispatch.is_some() {
            self.raise_abort();
        }
    }
}

fn join<T>(handle: Option<JoinHandle<T>>, name: &'static str) -> Result<Option<T>, PipelineError> {
    match handle {
        Some(handle) => handle
            .join()
            .map(Some)
            .map_err(|_| PipelineError::WorkerPanicked(name)),
        None => Ok(None),
    }
}
