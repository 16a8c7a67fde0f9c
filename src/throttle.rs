//! Trailing-edge cursor throttle (§4.5).
//!
//! Enforces a minimum interval between emitted `cursor:update` messages for
//! one session while guaranteeing the final position in a burst is always
//! delivered, even if it arrives inside the throttle window. A naive
//! "emit every Nth event" scheme would drop that final position.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

struct ThrottleState<T> {
    last_sent_at: Option<Instant>,
    pending: Option<T>,
    timer: Option<JoinHandle<()>>,
}

/// `T` is the cursor payload; `emit` is invoked with the latest value,
/// either immediately or from the trailing-edge timer task.
pub struct CursorThrottle<T>
where
    T: Clone + Send + 'static,
{
    interval: Duration,
    state: Arc<Mutex<ThrottleState<T>>>,
    emit: Arc<dyn Fn(T) + Send + Sync + 'static>,
}

impl<T> CursorThrottle<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(interval: Duration, emit: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            interval,
            state: Arc::new(Mutex::new(ThrottleState {
                last_sent_at: None,
                pending: None,
                timer: None,
            })),
            emit: Arc::new(emit),
        }
    }

    /// Submits a new cursor value. Emits immediately if outside the
    /// throttle window, otherwise arms (or leaves armed) a trailing-edge
    /// timer that will emit the latest submitted value.
    pub fn submit(&self, value: T) {
        let now = Instant::now();
        let mut state = self.state.lock();

        let ready = match state.last_sent_at {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        };

        if ready {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.pending = None;
            state.last_sent_at = Some(now);
            drop(state);
            (self.emit)(value);
            return;
        }

        state.pending = Some(value);
        if state.timer.is_some() {
            return;
        }

        let last_sent_at = state
            .last_sent_at
            .expect("last_sent_at set when throttle window is active");
        let remaining = self.interval - now.duration_since(last_sent_at);
        let state_handle = self.state.clone();
        let emit = self.emit.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            let value = {
                let mut state = state_handle.lock();
                state.timer = None;
                state.last_sent_at = Some(Instant::now());
                state.pending.take()
            };
            if let Some(value) = value {
                emit(value);
            }
        });
        state.timer = Some(handle);
    }
}
