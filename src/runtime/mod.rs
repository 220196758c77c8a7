//! Threading primitives shared by the pipeline activities.

pub mod backpressure;
pub mod handoff;
pub mod pipeline;
pub mod retry;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use backpressure::{BackpressureError, BackpressureQueue, REPORT_QUEUE_CAPACITY};
pub use handoff::{handoff, HandoffReceiver, HandoffSendError, HandoffSender, HandoffSignal};
pub use pipeline::{Pipeline, PipelineError, PipelineHandle, PipelineParts, ShutdownReport};
pub use retry::{Attempted, RetryError, RetryPolicy};

/// Locks a mutex, recovering the guard if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
