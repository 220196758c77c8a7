use super::lock;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Items travelling through a hand-off queue.
#[derive(Debug, PartialEq, Eq)]
pub enum HandoffSignal<T> {
    Work(T),
    /// Producer finished; the consumer drains and exits.
    Shutdown,
}

/// Error returned when enqueuing fails; the item is handed back.
#[derive(Debug, PartialEq, Eq)]
pub enum HandoffSendError<T> {
    Full(T),
    Closed(T),
}

struct Shared<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    cv: Condvar,
}

struct QueueState<T> {
    buffer: VecDeque<HandoffSignal<T>>,
    closed: bool,
}

/// Bounded blocking queue between two activities. Sending never blocks.
pub fn handoff<T>(capacity: usize) -> (HandoffSender<T>, HandoffReceiver<T>) {
    assert!(capacity > 0, "hand-off queue capacity must be > 0");
    let shared = Arc::new(Shared {
        capacity,
        state: Mutex::new(QueueState {
            buffer: VecDeque::with_capacity(capacity),
            closed: false,
        }),
        cv: Condvar::new(),
    });
    (
        HandoffSender {
            shared: Arc::clone(&shared),
        },
        HandoffReceiver { shared },
    )
}

pub struct HandoffSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for HandoffSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> HandoffSender<T> {
    pub fn try_send(&self, item: T) -> Result<(), HandoffSendError<T>> {
        let mut guard = lock(&self.shared.state);
        if guard.closed {
            return Err(HandoffSendError::Closed(item));
        }
        let pending = guard
            .buffer
            .iter()
            .filter(|signal| matches!(signal, HandoffSignal::Work(_)))
            .count();
        if pending >= self.shared.capacity {
            return Err(HandoffSendError::Full(item));
        }
        guard.buffer.push_back(HandoffSignal::Work(item));
        self.shared.cv.notify_one();
        Ok(())
    }

    /// Queues a shutdown marker behind any pending work.
    pub fn signal_shutdown(&self) {
        let mut guard = lock(&self.shared.state);
        if guard.closed {
            return;
        }
        guard.buffer.push_back(HandoffSignal::Shutdown);
        self.shared.cv.notify_all();
    }

    /// Drops pending work and wakes the consumer immediately.
    pub fn close(&self) {
        let mut guard = lock(&self.shared.state);
        guard.closed = true;
        guard.buffer.clear();
        self.shared.cv.notify_all();
    }

    pub fn depth(&self) -> usize {
        lock(&self.shared.state).buffer.len()
    }
}

pub struct HandoffReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> HandoffReceiver<T> {
    /// Waits up to `timeout` for the next signal; `None` on timeout or once closed.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<HandoffSignal<T>> {
        let deadline = Instant::now() + timeout;
        let mut guard = lock(&self.shared.state);
        loop {
            if let Some(signal) = guard.buffer.pop_front() {
                return Some(signal);
            }
            if guard.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = self
                .shared
                .cv
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard = next;
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).closed
    }
}
