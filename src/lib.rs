//! Tallyline: consumes change events for a single numeric field, folds them
//! into a running aggregate, and republishes committed snapshots to an upsert
//! store and an append-only log with offset-gated recovery.

pub mod app;
pub mod commit;
pub mod config;
pub mod event_model;
pub mod observability;
pub mod runtime;
pub mod sink;
pub mod source;

pub use commit::{
    CommitCoordinator, CoordinatorState, TickDecision, UnchangedTickPolicy,
    DEFAULT_COMMIT_INTERVAL_MS,
};
pub use config::{ConfigError, PipelineConfig};
pub use event_model::{
    AggregationPolicy, ApplyOutcome, ChangeEvent, ChangeKind, CheckpointStore,
    FileCheckpointStore, IncrementalReducer, ManualClock, MemoryCheckpointStore, OffsetCheckpoint,
    OffsetGate, OffsetManager, ReduceError, RunningAggregate, Snapshot, SystemWallClock,
    WallClock,
};
pub use observability::{
    HealthReport, JsonLineLogger, LogLevel, LogRotationPolicy, Logger, PipelineHealth,
    PipelineMetrics,
};
pub use runtime::{
    Pipeline, PipelineError, PipelineHandle, PipelineParts, RetryPolicy, ShutdownReport,
};
pub use sink::{
    open_sink, AppendLogSink, DispatchReport, MutableStoreSink, SinkDispatcher, SinkError,
    SinkKind, SinkTarget, SnapshotSink, WriteAck,
};
pub use source::{
    Broker, MemoryBroker, RestProxyBroker, SourceAdapter, SourceItem, SourceOptions,
    Subscription,
};
