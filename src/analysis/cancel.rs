//! Cooperative cancellation for one analysis run.
//!
//! A [`CancellationToken`] is cancelled at most once, by the global timer,
//! by an operator, or by shutdown. Callbacks registered with
//! [`CancellationToken::on_cancel`] run synchronously inside the cancelling
//! call, exactly once. Registering after cancellation runs the callback
//! immediately.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

type Callback = Box<dyn FnOnce(CancelReason) + Send>;

/// What cancelled a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelReason {
    Timeout,
    Operator,
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Timeout => "timeout",
            Self::Operator => "operator",
            Self::Shutdown => "shutdown",
        })
    }
}

struct Inner {
    cancelled: AtomicBool,
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    reason: Option<CancelReason>,
    callbacks: Vec<Callback>,
}

/// Shared cancellation flag. Clones observe the same state.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.state.lock().reason
    }

    /// Cancel the token. Returns `true` only for the call that actually
    /// cancelled it; later calls are no-ops.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock();
            if self.inner.cancelled.swap(true, Ordering::AcqRel) {
                return false;
            }
            state.reason = Some(reason);
            std::mem::take(&mut state.callbacks)
        };

        self.inner.notify.notify_waiters();
        for callback in callbacks {
            callback(reason);
        }
        true
    }

    /// Register a callback fired on cancellation.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce(CancelReason) + Send + 'static,
    {
        let reason = {
            let mut state = self.inner.state.lock();
            match state.reason {
                Some(reason) => reason,
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };

        callback(reason);
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        token.on_cancel(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(token.cancel(CancelReason::Timeout));
        assert!(!token.cancel(CancelReason::Operator));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(token.reason(), Some(CancelReason::Timeout));
    }

    #[test]
    fn test_late_callback_runs_immediately() {
        let token = CancellationToken::new();
        token.cancel(CancelReason::Operator);

        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        token.on_cancel(move |reason| *slot.lock() = Some(reason));

        assert_eq!(*seen.lock(), Some(CancelReason::Operator));
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel(CancelReason::Shutdown);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel(CancelReason::Timeout);

        let result = tokio::time::timeout(Duration::from_millis(500), handle).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel(CancelReason::Timeout);
        let result = tokio::time::timeout(Duration::from_millis(50), token.cancelled()).await;
        assert!(result.is_ok());
    }
}
