//! Value types flowing through the pipeline: decoded change events, the
//! running aggregate, snapshots taken from it, and durable checkpoints.

pub mod aggregate;
pub mod change_event;
pub mod checkpoint;
pub mod clock;
pub mod snapshot;

pub use aggregate::{
    AggregationPolicy, ApplyOutcome, IncrementalReducer, OutOfOrderError, ReduceError,
    RunningAggregate,
};
pub use change_event::{ChangeEvent, ChangeKind};
pub use checkpoint::{
    CheckpointLoadError, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
    OffsetCheckpoint, OffsetGate, OffsetManager, PersistError, CHECKPOINT_FORMAT_VERSION,
};
pub use clock::{ManualClock, SystemWallClock, WallClock};
pub use snapshot::Snapshot;
