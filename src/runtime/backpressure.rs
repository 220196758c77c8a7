use crossbeam_queue::ArrayQueue;
use std::fmt;
use std::sync::Arc;

/// Dispatch reports waiting for the commit activity; one per in-flight snapshot plus slack.
pub const REPORT_QUEUE_CAPACITY: usize = 4;

/// Lock-free bounded queue. Producers never block: a full queue is an error
/// the caller must handle instead of an unbounded buffer.
#[derive(Debug)]
pub struct BackpressureQueue<T> {
    label: &'static str,
    queue: Arc<ArrayQueue<T>>,
}

impl<T> Clone for BackpressureQueue<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label,
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<T> BackpressureQueue<T> {
    /// Queue carrying dispatch reports back to the commit coordinator.
    pub fn dispatch_reports() -> Self {
        Self::new("dispatch_report", REPORT_QUEUE_CAPACITY)
    }

    pub fn new(label: &'static str, capacity: usize) -> Self {
        assert!(capacity > 0, "backpressure queue capacity must be > 0");
        Self {
            label,
            queue: Arc::new(ArrayQueue::new(capacity)),
        }
    }

    /// Attempts to enqueue an item; a saturated queue hands the item back.
    pub fn enqueue(&self, item: T) -> Result<(), BackpressureError<T>> {
        self.queue.push(item).map_err(|item| BackpressureError {
            label: self.label,
            item,
        })
    }

    pub fn try_dequeue(&self) -> Option<T> {
        self.queue.pop()
    }

    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Returned when pushing onto a saturated queue.
pub struct BackpressureError<T> {
    pub label: &'static str,
    pub item: T,
}

impl<T> BackpressureError<T> {
    /// Human readable label describing the saturated queue.
    pub fn message(&self) -> String {
        format!("{}_queue_saturated", self.label)
    }

    pub fn into_item(self) -> T {
        self.item
    }
}

impl<T> fmt::Debug for BackpressureError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackpressureError")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for BackpressureError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}
