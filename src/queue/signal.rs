//! Cooperative abort flag handed to running operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

/// A one-shot, cloneable abort flag.
///
/// The queue never preempts a running operation. Instead, operations
/// submitted with [`KeyedQueue::schedule_with_signal`](super::KeyedQueue::schedule_with_signal)
/// receive the signal of their lane and may check or await it to stop early
/// when [`KeyedQueue::abort`](super::KeyedQueue::abort) is called.
///
/// # Examples
///
/// ```rust
/// use keylane::queue::AbortSignal;
///
/// let signal = AbortSignal::new();
/// assert!(!signal.is_aborted());
///
/// signal.abort("shutting down");
/// assert!(signal.is_aborted());
/// assert_eq!(signal.reason().as_deref(), Some("shutting down"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

#[derive(Debug, Default)]
struct SignalInner {
    aborted: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl AbortSignal {
    /// Creates a signal that has not been fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal. Only the first reason is kept; later calls are no-ops.
    pub fn abort(&self, reason: impl Into<String>) {
        let mut slot = self
            .inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.inner.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        *slot = Some(reason.into());
        drop(slot);
        self.inner.notify.notify_waiters();
    }

    /// Returns `true` once [`abort`](Self::abort) has been called.
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    /// The reason passed to [`abort`](Self::abort), if the signal has fired.
    pub fn reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolves once the signal fires. Returns immediately if it already has.
    pub async fn aborted(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent `abort` cannot
            // slip between the check and the wait.
            notified.as_mut().enable();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn first_reason_wins() {
        let signal = AbortSignal::new();
        signal.abort("first");
        signal.abort("second");
        assert_eq!(signal.reason().as_deref(), Some("first"));
    }

    #[test]
    fn clones_share_state() {
        let signal = AbortSignal::new();
        let clone = signal.clone();
        clone.abort("stop");
        assert!(signal.is_aborted());
    }

    #[tokio::test]
    async fn aborted_returns_immediately_when_already_fired() {
        let signal = AbortSignal::new();
        signal.abort("done");
        tokio::time::timeout(Duration::from_millis(50), signal.aborted())
            .await
            .expect("signal already fired");
    }

    #[tokio::test]
    async fn aborted_wakes_waiter() {
        let signal = AbortSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.aborted().await })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        signal.abort("wake up");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }
}
