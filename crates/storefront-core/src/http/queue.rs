//! Admission control for outgoing requests.
//!
//! Requests are admitted in FIFO order, at most `max_per_second` in any
//! rolling one-second window. A server-signaled overload pauses admission
//! globally until the pause elapses. Nothing is ever dropped: a request
//! that cannot be admitted yet waits, and a timer re-runs the drain.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};

use super::task_failure;
use crate::error::ApiError;

/// Length of the rolling admission window.
const WINDOW: Duration = Duration::from_secs(1);

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<oneshot::Sender<()>>,
    /// Admission instants inside the current window, oldest first
    admitted: VecDeque<Instant>,
    rate_limited_until: Option<Instant>,
    timer_armed: bool,
    disposed: bool,
    admitted_total: u64,
}

struct QueueInner {
    max_per_second: usize,
    drain_retry_delay: Duration,
    state: Mutex<QueueState>,
}

impl QueueInner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn drain(self: &Arc<Self>) {
        let mut state = self.state();
        while !state.waiting.is_empty() {
            let now = Instant::now();

            if let Some(until) = state.rate_limited_until {
                if now < until {
                    self.arm_timer(&mut state, until);
                    return;
                }
                state.rate_limited_until = None;
                debug!("Overload pause elapsed, resuming admission");
            }

            while let Some(&oldest) = state.admitted.front() {
                if now.duration_since(oldest) >= WINDOW {
                    state.admitted.pop_front();
                } else {
                    break;
                }
            }

            if state.admitted.len() >= self.max_per_second {
                self.arm_timer(&mut state, now + self.drain_retry_delay);
                return;
            }

            if let Some(waiter) = state.waiting.pop_front() {
                // A closed receiver means the request task is gone; it does
                // not use up a slot.
                if waiter.send(()).is_ok() {
                    state.admitted.push_back(now);
                    state.admitted_total += 1;
                }
            }
        }
    }

    fn arm_timer(self: &Arc<Self>, state: &mut QueueState, at: Instant) {
        if state.timer_armed {
            return;
        }
        state.timer_armed = true;
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            inner.state().timer_armed = false;
            inner.drain();
        });
    }
}

/// FIFO request queue with a per-second admission ceiling.
///
/// Clone is cheap; clones share the same window and pause.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl RequestQueue {
    pub fn new(max_per_second: usize, drain_retry_delay: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                max_per_second: max_per_second.max(1),
                drain_retry_delay,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Wait for admission, then run `request`.
    ///
    /// The request runs in its own task once submitted, so it completes
    /// even if the caller stops waiting. Its result is returned unchanged.
    pub async fn enqueue<F, Fut, T>(&self, request: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
        T: Send + 'static,
    {
        let (admit, admitted) = oneshot::channel();
        {
            let mut state = self.inner.state();
            if state.disposed {
                return Err(ApiError::Disposed);
            }
            state.waiting.push_back(admit);
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            if admitted.await.is_err() {
                return Err(ApiError::Disposed);
            }
            let result = request().await;
            inner.drain();
            result
        });
        self.inner.drain();

        handle.await.map_err(task_failure)?
    }

    /// Pause admission for `duration`. An active pause is never shortened.
    pub fn set_rate_limited(&self, duration: Duration) {
        let until = Instant::now() + duration;
        {
            let mut state = self.inner.state();
            match state.rate_limited_until {
                Some(current) if current >= until => return,
                _ => state.rate_limited_until = Some(until),
            }
        }
        info!(pause_ms = duration.as_millis() as u64, "Request admission paused");
        self.inner.drain();
    }

    pub fn is_rate_limited(&self) -> bool {
        self.inner
            .state()
            .rate_limited_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Requests waiting for admission
    pub fn pending(&self) -> usize {
        self.inner.state().waiting.len()
    }

    /// Total requests admitted since creation
    pub fn admitted_total(&self) -> u64 {
        self.inner.state().admitted_total
    }

    /// Refuse new submissions. Requests already queued are still admitted.
    pub fn dispose(&self) {
        self.inner.state().disposed = true;
        debug!("Request queue disposed");
    }
}
