use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const CANCEL_POLL_SLICE: Duration = Duration::from_millis(10);

/// Bounded exponential backoff shared by broker connects, sink writes, and checkpoint persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Policy without waits between attempts, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1,
        }
    }

    /// Delay after the `failed_attempts`-th consecutive failure.
    pub fn backoff_for(&self, failed_attempts: u32) -> Duration {
        let mut delay = self.initial_backoff_ms;
        for _ in 1..failed_attempts {
            if delay >= self.max_backoff_ms {
                break;
            }
            delay = delay.saturating_mul(u64::from(self.multiplier.max(1)));
        }
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    /// Runs `op` until it succeeds, the attempt budget is spent, or `cancel` is raised.
    /// The closure receives the 1-based attempt number.
    pub fn run<T, E>(
        &self,
        cancel: &AtomicBool,
        mut op: impl FnMut(u32) -> Result<T, E>,
    ) -> Result<Attempted<T>, RetryError<E>> {
        let budget = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt) {
                Ok(value) => {
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    })
                }
                Err(err) if attempt >= budget => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    })
                }
                Err(err) => {
                    if !sleep_unless_cancelled(self.backoff_for(attempt), cancel) {
                        return Err(RetryError::Cancelled {
                            attempts: attempt,
                            last: Some(err),
                        });
                    }
                }
            }
        }
    }
}

/// Successful value together with the number of attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Terminal outcome of a retried operation.
#[derive(Debug)]
pub enum RetryError<E> {
    Exhausted { attempts: u32, last: E },
    Cancelled { attempts: u32, last: Option<E> },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Cancelled { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Cancelled { last, .. } => last.as_ref(),
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Cancelled { last, .. } => last,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
            RetryError::Cancelled {
                attempts,
                last: Some(last),
            } => write!(f, "cancelled after {attempts} attempts: {last}"),
            RetryError::Cancelled { attempts, last: None } => {
                write!(f, "cancelled after {attempts} attempts")
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

fn sleep_unless_cancelled(delay: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if cancel.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_POLL_SLICE));
    }
}
