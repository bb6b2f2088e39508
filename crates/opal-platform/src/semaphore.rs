//! Waitable, duplicable binary semaphores.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::object::next_object_id;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("semaphore wait timed out")]
pub struct WaitTimedOut;

struct SemaphoreInner {
    id: u64,
    signaled: Mutex<bool>,
    cv: Condvar,
}

/// Binary semaphore shared between connections by duplicating the handle.
///
/// Signal and reset are explicit; a successful wait does not consume the
/// signaled state.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SemaphoreInner {
                id: next_object_id(),
                signaled: Mutex::new(false),
                cv: Condvar::new(),
            }),
        }
    }

    /// Object id; duplicates of one semaphore share it.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn duplicate(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Wakes all current waiters. Signaling a signaled semaphore is a no-op.
    pub fn signal(&self) {
        let mut signaled = self.inner.signaled.lock().unwrap();
        if !*signaled {
            *signaled = true;
            self.inner.cv.notify_all();
        }
    }

    pub fn reset(&self) {
        *self.inner.signaled.lock().unwrap() = false;
    }

    pub fn is_signaled(&self) -> bool {
        *self.inner.signaled.lock().unwrap()
    }

    /// Blocks until signaled. With a timeout, returns [`WaitTimedOut`] if the
    /// semaphore stays unsignaled past the deadline.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), WaitTimedOut> {
        let mut signaled = self.inner.signaled.lock().unwrap();
        match timeout {
            None => {
                while !*signaled {
                    signaled = self.inner.cv.wait(signaled).unwrap();
                }
                Ok(())
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*signaled {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(WaitTimedOut);
                    }
                    let (guard, result) = self
                        .inner
                        .cv
                        .wait_timeout(signaled, deadline - now)
                        .unwrap();
                    signaled = guard;
                    if result.timed_out() && !*signaled {
                        return Err(WaitTimedOut);
                    }
                }
                Ok(())
            }
        }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("id", &self.inner.id)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}
