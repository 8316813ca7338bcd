//! Debounce slots — collapse a burst of calls on one key into the last one.

use std::collections::hash_map::Entry;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::error::Rejection;
use super::task::{Job, TaskRecord};
use super::{AbortSignal, Completion, Inner, KeyedQueue};

/// The most recent debounced call for a key, waiting out its delay.
pub(super) struct DebounceSlot {
    // Matches the generation captured by the live timer; older timers see a
    // mismatch and do nothing.
    generation: u64,
    latest: Box<dyn Job>,
    timer: JoinHandle<()>,
}

impl DebounceSlot {
    /// Stops the timer and rejects the stored call.
    pub(super) fn discard(self, rejection: &Rejection) {
        self.timer.abort();
        self.latest.reject(rejection.clone());
    }
}

impl KeyedQueue {
    /// Runs `operation` on the lane for `key` once `delay` passes without
    /// another `debounce` call for the same key.
    ///
    /// Each new call restarts the delay and replaces the stored operation;
    /// the completion of the call it replaced resolves right away with
    /// [`QueueError::Debounced`](super::QueueError::Debounced). Out of N calls
    /// in overlapping windows exactly one operation runs, the last one.
    ///
    /// When the delay elapses the operation is appended to the key's regular
    /// lane, so it never overlaps work [`schedule`](Self::schedule)d under the
    /// same key. A call made while that operation is running opens a new
    /// window.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use keylane::queue::KeyedQueue;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let queue = KeyedQueue::new();
    /// let delay = Duration::from_millis(20);
    ///
    /// let first = queue.debounce("webhook/evt_1", || async { Ok::<_, std::io::Error>(1) }, delay);
    /// let second = queue.debounce("webhook/evt_1", || async { Ok::<_, std::io::Error>(2) }, delay);
    ///
    /// assert!(first.await.unwrap_err().is_debounced());
    /// assert_eq!(second.await.unwrap(), 2);
    /// # }
    /// ```
    pub fn debounce<Op, Fut, T, E>(
        &self,
        key: impl Into<String>,
        operation: Op,
        delay: Duration,
    ) -> Completion<T, E>
    where
        Op: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let key = key.into();
        let (job, completion) = TaskRecord::new(move |_signal: AbortSignal| operation());
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);

        let superseded = {
            let mut slots = self.inner.lock_slots();
            // Spawned under the lock: even a zero delay cannot fire before the
            // slot it belongs to is in the map.
            let timer = tokio::spawn(fire_after(
                Arc::clone(&self.inner),
                key.clone(),
                generation,
                delay,
            ));

            match slots.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    let slot = entry.get_mut();
                    slot.timer.abort();
                    slot.timer = timer;
                    slot.generation = generation;
                    Some(std::mem::replace(&mut slot.latest, job))
                }
                Entry::Vacant(entry) => {
                    entry.insert(DebounceSlot {
                        generation,
                        latest: job,
                        timer,
                    });
                    None
                }
            }
        };

        if let Some(previous) = superseded {
            trace!(key = %key, delay_ms = delay.as_millis(), "debounced call superseded");
            previous.reject(Rejection::Debounced);
        }

        completion
    }
}

impl Inner {
    pub(super) fn take_slot(&self, key: &str) -> Option<DebounceSlot> {
        self.lock_slots().remove(key)
    }

    /// Moves the slot's call into the key's lane if `generation` is still the
    /// live one.
    fn fire_slot(self: &Arc<Self>, key: &str, generation: u64) {
        let mut slots = self.lock_slots();
        if !slots
            .get(key)
            .is_some_and(|slot| slot.generation == generation)
        {
            return;
        }

        if let Some(slot) = slots.remove(key) {
            debug!(key = %key, "debounce delay elapsed");
            // Still holding the slot lock, so `await_all` never sees the gap
            // between the slot leaving and the lane opening.
            self.enqueue(key.to_owned(), slot.latest);
        }
    }
}

async fn fire_after(inner: Arc<Inner>, key: String, generation: u64, delay: Duration) {
    tokio::time::sleep(delay).await;
    inner.fire_slot(&key, generation);
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::Mutex;

    use tokio::sync::oneshot;
    use tokio::time::Instant;

    use super::*;
    use crate::queue::QueueError;

    const KEY: &str = "webhook/evt_1";

    type Runs = Arc<Mutex<Vec<(&'static str, Instant)>>>;

    fn recorded(
        runs: &Runs,
        label: &'static str,
    ) -> impl FnOnce() -> std::future::Ready<Result<&'static str, Infallible>> + Send + 'static
    {
        let runs = Arc::clone(runs);
        move || {
            runs.lock().unwrap().push((label, Instant::now()));
            std::future::ready(Ok(label))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn later_call_supersedes_earlier_one() {
        let queue = KeyedQueue::new();
        let runs = Runs::default();
        let delay = Duration::from_millis(1000);

        let first = queue.debounce(KEY, recorded(&runs, "op1"), delay);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second_at = Instant::now();
        let second = queue.debounce(KEY, recorded(&runs, "op2"), delay);

        assert!(first.await.unwrap_err().is_debounced());
        assert_eq!(second.await.unwrap(), "op2");

        let runs = runs.lock().unwrap();
        assert_eq!(runs.len(), 1);
        let (label, ran_at) = runs[0];
        assert_eq!(label, "op2");
        assert!(ran_at.duration_since(second_at) >= delay);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_resolves_every_completion() {
        let queue = KeyedQueue::new();
        let runs = Runs::default();
        let labels = ["a", "b", "c", "d", "e"];

        let mut completions = Vec::new();
        for label in labels {
            let delay = Duration::from_millis(200);
            completions.push(queue.debounce(KEY, recorded(&runs, label), delay));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let last = completions.pop().unwrap();
        for completion in completions {
            assert!(matches!(completion.await, Err(QueueError::Debounced)));
        }
        assert_eq!(last.await.unwrap(), "e");
        assert_eq!(runs.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn single_call_waits_for_full_delay() {
        let queue = KeyedQueue::new();
        let runs = Runs::default();

        let completion = queue.debounce(KEY, recorded(&runs, "only"), Duration::from_millis(500));
        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(runs.lock().unwrap().is_empty());
        assert_eq!(queue.snapshot().debouncing, vec![KEY.to_string()]);

        assert_eq!(completion.await.unwrap(), "only");
        queue.await_all().await;
        assert!(queue.snapshot().debouncing.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_debounce_independently() {
        let queue = KeyedQueue::new();
        let runs = Runs::default();
        let delay = Duration::from_millis(100);

        let a = queue.debounce("webhook/a", recorded(&runs, "a"), delay);
        let b = queue.debounce("webhook/b", recorded(&runs, "b"), delay);

        assert_eq!(a.await.unwrap(), "a");
        assert_eq!(b.await.unwrap(), "b");
    }

    #[tokio::test(start_paused = true)]
    async fn fired_call_waits_behind_scheduled_work() {
        let queue = KeyedQueue::new();
        let runs = Runs::default();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let busy = queue.schedule(KEY, move || async move {
            let _ = release_rx.await;
            Ok::<_, Infallible>("busy")
        });
        let debounced = queue.debounce(KEY, recorded(&runs, "check"), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runs.lock().unwrap().is_empty());
        assert_eq!(queue.pending_count(KEY), 1);

        release_tx.send(()).unwrap();
        assert_eq!(busy.await.unwrap(), "busy");
        assert_eq!(debounced.await.unwrap(), "check");
    }

    #[tokio::test(start_paused = true)]
    async fn abort_discards_waiting_call() {
        let queue = KeyedQueue::new();
        let runs = Runs::default();

        let completion = queue.debounce(KEY, recorded(&runs, "never"), Duration::from_secs(5));
        queue.abort(KEY, "shutting down");

        assert!(completion.await.unwrap_err().is_aborted());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(runs.lock().unwrap().is_empty());
        queue.await_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_call_reports_its_own_error() {
        let queue = KeyedQueue::new();

        let completion = queue.debounce(
            KEY,
            || async { Err::<(), _>("boom") },
            Duration::from_millis(100),
        );

        assert!(matches!(completion.await, Err(QueueError::Operation("boom"))));
        queue.await_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn abort_all_discards_waiting_calls() {
        let queue = KeyedQueue::new();
        let runs = Runs::default();
        let delay = Duration::from_secs(5);

        let a = queue.debounce("webhook/a", recorded(&runs, "a"), delay);
        let b = queue.debounce("webhook/b", recorded(&runs, "b"), delay);
        assert_eq!(queue.snapshot().debouncing.len(), 2);

        queue.abort_all("shutting down");

        for completion in [a, b] {
            assert!(matches!(
                completion.await,
                Err(QueueError::Aborted { reason }) if reason == "shutting down"
            ));
        }
        assert!(queue.snapshot().debouncing.is_empty());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(runs.lock().unwrap().is_empty());
        queue.await_all().await;
    }
}
