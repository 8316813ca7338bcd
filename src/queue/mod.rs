//! Keyed task queue — at most one running task per key.
//!
//! [`KeyedQueue`] serializes asynchronous operations that touch the same
//! logical resource. Callers pick a key per resource (`"payments/42"`,
//! `"webshop-stock/7"`); every operation scheduled under a key runs strictly
//! after the previous one for that key has finished, in submission order.
//! Operations under different keys run fully concurrently.
//!
//! ## Operations
//!
//! | Method                                   | Effect                                                  |
//! |------------------------------------------|---------------------------------------------------------|
//! | [`schedule`](KeyedQueue::schedule)       | append to the key's lane, run when it reaches the head |
//! | [`debounce`](KeyedQueue::debounce)       | coalesce a burst of calls into the last one            |
//! | [`cancel`](KeyedQueue::cancel)           | drop queued, not-yet-started tasks                     |
//! | [`abort`](KeyedQueue::abort)             | drop queued tasks and signal the running one           |
//! | [`await_all`](KeyedQueue::await_all)     | wait until every lane has drained                      |
//!
//! ## Execution model
//!
//! The first task submitted to an idle key opens a lane and spawns a driver
//! onto the current Tokio runtime. The driver runs the lane's tasks one by
//! one, each inside its own spawned task so a panic cannot wedge the lane,
//! and removes the lane from the map once it is empty. Because the work is
//! owned by the driver, dropping a [`Completion`] does not stop the task.
//!
//! All methods that submit work must be called from within a Tokio runtime.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, trace, warn};

mod debounce;
mod error;
mod signal;
mod task;

pub use error::QueueError;
pub use signal::AbortSignal;
pub use task::Completion;

use debounce::DebounceSlot;
use error::Rejection;
use task::{Job, TaskRecord};

/// Per-key FIFO of task records waiting behind the running one.
///
/// A lane only exists in the map while its driver is active, so presence in
/// the map doubles as the "running" flag.
struct Lane {
    pending: VecDeque<Box<dyn Job>>,
    // Abort signal of the task the driver is currently executing.
    current: AbortSignal,
}

#[derive(Default)]
struct Inner {
    lanes: Mutex<HashMap<String, Lane>>,
    slots: Mutex<HashMap<String, DebounceSlot>>,
    // Monotonic id for debounce timers, so a stale timer never fires a newer slot.
    generation: AtomicU64,
    // Woken whenever a lane or a debounce slot disappears.
    drained: Notify,
}

/// Serializes async operations per key.
///
/// Cloning is cheap; all clones share the same lanes. Construct one per
/// component that needs coordination and pass it to the call sites, rather
/// than reaching for a global.
///
/// # Examples
///
/// ```rust
/// use keylane::queue::KeyedQueue;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let queue = KeyedQueue::new();
///
/// // Both requests touch payment 42: the second one waits for the first.
/// let first = queue.schedule("payments/42", || async { Ok::<_, std::io::Error>("settled") });
/// let second = queue.schedule("payments/42", || async { Ok::<_, std::io::Error>("noop") });
///
/// assert_eq!(first.await.unwrap(), "settled");
/// assert_eq!(second.await.unwrap(), "noop");
/// # }
/// ```
#[derive(Clone, Default)]
pub struct KeyedQueue {
    inner: Arc<Inner>,
}

/// Point-in-time view of a [`KeyedQueue`], suitable for health output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    /// Active lanes, sorted by key.
    pub lanes: Vec<LaneSnapshot>,
    /// Keys with a debounced call waiting out its delay, sorted.
    pub debouncing: Vec<String>,
}

/// One active lane in a [`QueueSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaneSnapshot {
    pub key: String,
    /// Tasks queued behind the running one.
    pub pending: usize,
    /// Whether the running task has been asked to abort.
    pub aborting: bool,
}

impl KeyedQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `operation` on the lane for `key`.
    ///
    /// The operation starts immediately if no other task for `key` is running
    /// or queued; otherwise it waits for every earlier task on that key to
    /// finish. The returned [`Completion`] resolves with the operation's own
    /// result: success values and errors are passed through untouched. A
    /// failing operation does not affect the tasks queued behind it.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn schedule<Op, Fut, T, E>(
        &self,
        key: impl Into<String>,
        operation: Op,
    ) -> Completion<T, E>
    where
        Op: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.schedule_with_signal(key, move |_signal| operation())
    }

    /// Like [`schedule`](Self::schedule), but hands the operation the
    /// [`AbortSignal`] that [`abort`](Self::abort) fires while it runs.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn schedule_with_signal<Op, Fut, T, E>(
        &self,
        key: impl Into<String>,
        operation: Op,
    ) -> Completion<T, E>
    where
        Op: FnOnce(AbortSignal) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let (job, completion) = TaskRecord::new(operation);
        self.inner.enqueue(key.into(), job);
        completion
    }

    /// Rejects every queued, not-yet-started task for `key` with
    /// [`QueueError::Cancelled`].
    ///
    /// The running task, if any, is left alone and completes normally.
    /// Returns the number of tasks that were cancelled; `0` if the key has no
    /// lane or nothing is queued.
    pub fn cancel(&self, key: &str) -> usize {
        let cancelled = self.inner.reject_pending(key, &Rejection::Cancelled);
        if cancelled > 0 {
            debug!(key = %key, cancelled, "cancelled queued tasks");
        }
        cancelled
    }

    /// Rejects queued tasks and any pending debounced call for `key` with
    /// [`QueueError::Aborted`], and fires the running task's [`AbortSignal`].
    ///
    /// Aborting is cooperative: the running operation keeps going until it
    /// observes the signal, and its completion still carries whatever it
    /// returns.
    pub fn abort(&self, key: &str, reason: impl Into<String>) {
        let reason = reason.into();
        let rejection = Rejection::Aborted(reason.clone());

        if let Some(slot) = self.inner.take_slot(key) {
            slot.discard(&rejection);
            self.inner.drained.notify_waiters();
        }
        let rejected = self.inner.reject_pending(key, &rejection);
        let signalled = self.inner.signal_running(key, &reason);

        if rejected > 0 || signalled {
            warn!(key = %key, reason = %reason, rejected, "aborted lane");
        }
    }

    /// [`abort`](Self::abort) for every key, including keys that only have a
    /// debounced call waiting.
    ///
    /// Pair with [`await_all`](Self::await_all) on shutdown.
    pub fn abort_all(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut keys: Vec<String> = self.inner.lock_slots().keys().cloned().collect();
        keys.extend(self.inner.lock_lanes().keys().cloned());
        keys.sort_unstable();
        keys.dedup();

        for key in &keys {
            self.abort(key, reason.clone());
        }
        debug!(lanes = keys.len(), reason = %reason, "aborted all lanes");
    }

    /// Resolves once no lane is active and no debounced call is waiting.
    ///
    /// Work submitted while waiting extends the wait.
    pub async fn await_all(&self) {
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.inner.is_idle() {
                return;
            }
            drained.await;
        }
    }

    /// Returns `true` while a task for `key` is running or queued.
    pub fn is_running(&self, key: &str) -> bool {
        self.inner.lock_lanes().contains_key(key)
    }

    /// Number of tasks for `key` waiting behind the running one.
    pub fn pending_count(&self, key: &str) -> usize {
        self.inner
            .lock_lanes()
            .get(key)
            .map_or(0, |lane| lane.pending.len())
    }

    /// Captures the current lanes and debounce slots.
    pub fn snapshot(&self) -> QueueSnapshot {
        let mut debouncing: Vec<String> = self.inner.lock_slots().keys().cloned().collect();
        debouncing.sort_unstable();

        let mut lanes: Vec<LaneSnapshot> = self
            .inner
            .lock_lanes()
            .iter()
            .map(|(key, lane)| LaneSnapshot {
                key: key.clone(),
                pending: lane.pending.len(),
                aborting: lane.current.is_aborted(),
            })
            .collect();
        lanes.sort_unstable_by(|a, b| a.key.cmp(&b.key));

        QueueSnapshot { lanes, debouncing }
    }
}

impl Inner {
    fn lock_lanes(&self) -> MutexGuard<'_, HashMap<String, Lane>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, DebounceSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `job` to the lane for `key`, opening the lane and spawning its
    /// driver if the key is idle.
    fn enqueue(self: &Arc<Self>, key: String, job: Box<dyn Job>) {
        let mut lanes = self.lock_lanes();
        if let Some(lane) = lanes.get_mut(&key) {
            lane.pending.push_back(job);
            trace!(key = %key, pending = lane.pending.len(), "task queued behind running task");
            return;
        }

        let signal = AbortSignal::new();
        lanes.insert(
            key.clone(),
            Lane {
                pending: VecDeque::new(),
                current: signal.clone(),
            },
        );
        drop(lanes);

        debug!(key = %key, "lane opened");
        tokio::spawn(drive_lane(Arc::clone(self), key, job, signal));
    }

    /// Pops the next task for `key`, or closes the lane if nothing is left.
    ///
    /// Runs under the same lock as [`enqueue`](Self::enqueue), so a task
    /// submitted concurrently either lands in `pending` before this check or
    /// opens a fresh lane after it.
    fn advance(&self, key: &str) -> Option<(Box<dyn Job>, AbortSignal)> {
        let mut lanes = self.lock_lanes();
        let lane = lanes.get_mut(key)?;

        if let Some(job) = lane.pending.pop_front() {
            lane.current = AbortSignal::new();
            return Some((job, lane.current.clone()));
        }

        lanes.remove(key);
        drop(lanes);

        debug!(key = %key, "lane drained");
        self.drained.notify_waiters();
        None
    }

    fn reject_pending(&self, key: &str, rejection: &Rejection) -> usize {
        let rejected: Vec<Box<dyn Job>> = match self.lock_lanes().get_mut(key) {
            Some(lane) => lane.pending.drain(..).collect(),
            None => return 0,
        };

        let count = rejected.len();
        for job in rejected {
            job.reject(rejection.clone());
        }
        count
    }

    fn signal_running(&self, key: &str, reason: &str) -> bool {
        match self.lock_lanes().get(key) {
            Some(lane) => {
                lane.current.abort(reason);
                true
            }
            None => false,
        }
    }

    fn is_idle(&self) -> bool {
        // Slots before lanes, matching the order a firing debounce timer uses.
        let slots = self.lock_slots();
        let lanes = self.lock_lanes();
        slots.is_empty() && lanes.is_empty()
    }
}

/// Runs the tasks of one lane back to back until the lane is empty.
async fn drive_lane(inner: Arc<Inner>, key: String, job: Box<dyn Job>, signal: AbortSignal) {
    let mut next = Some((job, signal));

    while let Some((job, signal)) = next {
        if let Err(e) = tokio::spawn(job.run(signal)).await {
            if e.is_panic() {
                error!(key = %key, "task panicked; continuing with the rest of the lane");
            } else {
                warn!(key = %key, error = %e, "task was cancelled by the runtime");
            }
        }
        next = inner.advance(&key);
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    const KEY: &str = "payments/42";

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_runs_one_at_a_time_in_submission_order() {
        let queue = KeyedQueue::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let completions: Vec<_> = (0..8)
            .map(|i| {
                let active = Arc::clone(&active);
                let max_active = Arc::clone(&max_active);
                let order = Arc::clone(&order);
                queue.schedule(KEY, move || async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    order.lock().unwrap().push(i);
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(i)
                })
            })
            .collect();

        for (i, completion) in completions.into_iter().enumerate() {
            assert_eq!(completion.await.unwrap(), i);
        }
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());

        queue.await_all().await;
        assert!(!queue.is_running(KEY));
    }

    #[tokio::test]
    async fn different_keys_do_not_wait_on_each_other() {
        let queue = KeyedQueue::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocked = queue.schedule("webshop-stock/1", move || async move {
            let _ = release_rx.await;
            Ok::<_, Infallible>("stock")
        });
        let other = queue.schedule("webshop-stock/2", || async { Ok::<_, Infallible>("other") });

        let other = tokio::time::timeout(Duration::from_secs(1), other)
            .await
            .expect("unrelated key was blocked");
        assert_eq!(other.unwrap(), "other");
        assert!(queue.is_running("webshop-stock/1"));

        release_tx.send(()).unwrap();
        assert_eq!(blocked.await.unwrap(), "stock");
    }

    #[tokio::test]
    async fn failure_is_propagated_and_does_not_stop_the_lane() {
        let queue = KeyedQueue::new();

        let failing = queue.schedule(KEY, || async { Err::<u32, _>("card declined") });
        let next = queue.schedule(KEY, || async { Ok::<_, &str>(2) });

        let err = failing.await.unwrap_err();
        assert_eq!(err.into_operation(), Some("card declined"));
        assert_eq!(next.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn panicking_task_interrupts_only_itself() {
        let queue = KeyedQueue::new();

        let panicking = queue.schedule(KEY, || async {
            if KEY.is_empty() {
                return Ok::<u32, Infallible>(0);
            }
            panic!("operation blew up");
        });
        let next = queue.schedule(KEY, || async { Ok::<_, Infallible>(1) });

        assert!(matches!(panicking.await, Err(QueueError::Interrupted)));
        assert_eq!(next.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancel_rejects_only_queued_tasks() {
        let queue = KeyedQueue::new();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let running = queue.schedule(KEY, move || async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok::<_, Infallible>("finished")
        });
        let queued_a = queue.schedule(KEY, || async { Ok::<_, Infallible>("a") });
        let queued_b = queue.schedule(KEY, || async { Ok::<_, Infallible>("b") });

        started_rx.await.unwrap();
        assert_eq!(queue.pending_count(KEY), 2);
        assert_eq!(queue.cancel(KEY), 2);
        assert_eq!(queue.pending_count(KEY), 0);

        assert!(queued_a.await.unwrap_err().is_cancelled());
        assert!(queued_b.await.unwrap_err().is_cancelled());

        release_tx.send(()).unwrap();
        assert_eq!(running.await.unwrap(), "finished");
    }

    #[tokio::test]
    async fn cancel_unknown_key_is_a_noop() {
        let queue = KeyedQueue::new();
        assert_eq!(queue.cancel("missing"), 0);
        assert!(!queue.is_running("missing"));
    }

    #[tokio::test]
    async fn cancel_then_reschedule_runs_after_current_task() {
        let queue = KeyedQueue::new();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let runs = Arc::new(AtomicUsize::new(0));

        let job = |runs: Arc<AtomicUsize>| {
            move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(())
            }
        };

        let running = queue.schedule("setup-steps/org-1", move || async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok::<_, Infallible>(())
        });
        let stale = queue.schedule("setup-steps/org-1", job(Arc::clone(&runs)));
        started_rx.await.unwrap();

        queue.cancel("setup-steps/org-1");
        let fresh = queue.schedule("setup-steps/org-1", job(Arc::clone(&runs)));

        release_tx.send(()).unwrap();
        running.await.unwrap();
        assert!(stale.await.unwrap_err().is_cancelled());
        fresh.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_completion_still_runs() {
        let queue = KeyedQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        drop(queue.schedule(KEY, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(())
        }));

        queue.await_all().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abort_rejects_queued_and_signals_running() {
        let queue = KeyedQueue::new();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let running = queue.schedule_with_signal(KEY, move |signal: AbortSignal| async move {
            let _ = started_tx.send(());
            signal.aborted().await;
            Err::<(), _>(signal.reason().unwrap_or_default())
        });
        let queued = queue.schedule(KEY, || async { Ok::<(), String>(()) });

        started_rx.await.unwrap();
        queue.abort(KEY, "shutting down");

        assert!(matches!(
            queued.await,
            Err(QueueError::Aborted { reason }) if reason == "shutting down"
        ));
        assert_eq!(
            running.await.unwrap_err().into_operation().as_deref(),
            Some("shutting down")
        );
    }

    #[tokio::test]
    async fn abort_all_then_await_all_drains_every_lane() {
        let queue = KeyedQueue::new();

        let completions: Vec<_> = ["billing/invoices-1", "billing/invoices-2"]
            .into_iter()
            .map(|key| {
                queue.schedule_with_signal(key, |signal: AbortSignal| async move {
                    signal.aborted().await;
                    Ok::<_, Infallible>("stopped")
                })
            })
            .collect();
        tokio::task::yield_now().await;
        assert_eq!(queue.snapshot().lanes.len(), 2);

        queue.abort_all("shutting down");
        tokio::time::timeout(Duration::from_secs(1), queue.await_all())
            .await
            .expect("lanes drained after abort_all");

        for completion in completions {
            assert_eq!(completion.await.unwrap(), "stopped");
        }
        assert!(queue.snapshot().lanes.is_empty());
    }

    #[tokio::test]
    async fn await_all_returns_immediately_when_idle() {
        let queue = KeyedQueue::new();
        tokio::time::timeout(Duration::from_millis(50), queue.await_all())
            .await
            .expect("idle queue");
    }

    #[tokio::test]
    async fn snapshot_reports_lanes_and_serializes() {
        let queue = KeyedQueue::new();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let running = queue.schedule(KEY, move || async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok::<_, Infallible>(())
        });
        let queued = queue.schedule(KEY, || async { Ok::<_, Infallible>(()) });
        started_rx.await.unwrap();

        let snapshot = queue.snapshot();
        assert_eq!(
            snapshot.lanes,
            vec![LaneSnapshot {
                key: KEY.to_string(),
                pending: 1,
                aborting: false,
            }]
        );
        assert_eq!(
            serde_json::to_value(&snapshot).unwrap(),
            serde_json::json!({
                "lanes": [{ "key": KEY, "pending": 1, "aborting": false }],
                "debouncing": []
            })
        );

        release_tx.send(()).unwrap();
        running.await.unwrap();
        queued.await.unwrap();
    }
}
