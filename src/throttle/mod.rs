//! Grouped throttled queue — coalesce high-frequency items into batch calls.
//!
//! [`GroupedThrottledQueue`] buffers items per group key and hands them to a
//! [`BatchHandler`] in size-bounded batches, either when asked to
//! ([`flush`](GroupedThrottledQueue::flush)) or automatically once
//! [`ThrottleConfig::max_delay`] has passed since the first item was buffered.
//!
//! ```text
//!  add_item("org-1", a) ─┐
//!  add_item("org-2", b) ─┼─> buffers ──(flush / shared timer)──> handler("org-1", [a, c])
//!  add_item("org-1", c) ─┘                                      handler("org-2", [b])
//! ```
//!
//! ## Delivery
//!
//! - Items of one group are delivered in insertion order, split into
//!   contiguous batches of at most `max_batch_size`. Batches of one group are
//!   handled one after another; different groups are handled concurrently.
//! - A group's buffer leaves the queue the moment it is dispatched. Items
//!   added afterwards start a new buffer.
//! - A handler that returns an error or panics is logged and skipped. Its
//!   batch counts as delivered and other groups are unaffected.
//!
//! The shared timer must be armed from within a Tokio runtime, so
//! [`add_item`](GroupedThrottledQueue::add_item) and friends must be called
//! from one.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

mod config;
mod handler;

pub use config::{ConfigError, MAX_BATCH_SIZE_VAR, MAX_DELAY_MS_VAR, ThrottleConfig};
pub use handler::{BatchHandler, HandlerError, HandlerFuture};

struct State<T> {
    buffers: HashMap<String, Vec<T>>,
    timer: Option<JoinHandle<()>>,
    // Bumped every time the timer is armed; a timer whose generation is stale
    // was superseded by a manual flush and must not flush again.
    timer_generation: u64,
    // Dispatched groups whose handler calls have not settled yet.
    in_flight: usize,
}

struct Shared<T> {
    handler: Arc<dyn BatchHandler<T>>,
    config: ThrottleConfig,
    state: Mutex<State<T>>,
    settled: Notify,
}

/// Buffers items per group and flushes them to a handler in batches.
///
/// Cloning is cheap; all clones share the same buffers, timer and handler.
///
/// # Examples
///
/// ```rust
/// use std::sync::{Arc, Mutex};
/// use keylane::throttle::{GroupedThrottledQueue, HandlerError};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = Arc::clone(&seen);
///
/// let queue = GroupedThrottledQueue::new(move |group: String, items: Vec<u32>| {
///     let sink = Arc::clone(&sink);
///     async move {
///         sink.lock().unwrap().push((group, items));
///         Ok::<(), HandlerError>(())
///     }
/// });
///
/// queue.add_items("org-1", [1, 2, 3]);
/// queue.flush_and_wait().await;
///
/// assert_eq!(*seen.lock().unwrap(), vec![("org-1".to_string(), vec![1, 2, 3])]);
/// # }
/// ```
pub struct GroupedThrottledQueue<T> {
    inner: Arc<Shared<T>>,
}

impl<T> Clone for GroupedThrottledQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> GroupedThrottledQueue<T> {
    /// Creates a queue with [`ThrottleConfig::default`].
    pub fn new<H, F>(handler: H) -> Self
    where
        H: Fn(String, Vec<T>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self::with_config(handler, ThrottleConfig::default())
    }

    /// Creates a queue with explicit batching limits.
    pub fn with_config<H, F>(handler: H, config: ThrottleConfig) -> Self
    where
        H: Fn(String, Vec<T>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self::from_handler(handler, config)
    }

    /// Creates a queue around any [`BatchHandler`] implementation.
    pub fn from_handler(handler: impl BatchHandler<T>, config: ThrottleConfig) -> Self {
        Self {
            inner: Arc::new(Shared {
                handler: Arc::new(handler),
                config,
                state: Mutex::new(State {
                    buffers: HashMap::new(),
                    timer: None,
                    timer_generation: 0,
                    in_flight: 0,
                }),
                settled: Notify::new(),
            }),
        }
    }

    /// Buffers one item under `group`.
    ///
    /// Never waits. If this is the first buffered item since the last flush,
    /// the shared timer is armed for [`ThrottleConfig::max_delay`]; otherwise
    /// the existing deadline is kept.
    pub fn add_item(&self, group: impl Into<String>, item: T) {
        self.add_items(group, std::iter::once(item));
    }

    /// Buffers several items under `group`, keeping their order.
    ///
    /// Adding an empty collection is a no-op.
    pub fn add_items(&self, group: impl Into<String>, items: impl IntoIterator<Item = T>) {
        let group = group.into();
        // Collected before locking: the iterator is caller code and may call
        // back into this queue.
        let mut items: Vec<T> = items.into_iter().collect();
        if items.is_empty() {
            return;
        }

        let mut state = self.inner.lock_state();
        let was_empty = state.buffers.is_empty();

        let buffered = match state.buffers.get_mut(&group) {
            Some(buffer) => {
                buffer.append(&mut items);
                buffer.len()
            }
            None => {
                let len = items.len();
                state.buffers.insert(group.clone(), items);
                len
            }
        };

        if was_empty && state.timer.is_none() {
            self.inner.arm_timer(&mut state);
        }
        trace!(group = %group, buffered, "items buffered");
    }

    /// Dispatches every buffered group to the handler and disarms the timer.
    ///
    /// Returns once the batches are handed off; use
    /// [`flush_and_wait`](Self::flush_and_wait) to wait for the handler.
    pub fn flush(&self) {
        self.inner.flush_all();
    }

    /// [`flush`](Self::flush), then waits for the dispatched handler calls
    /// to settle. Handler failures are logged, not returned.
    pub async fn flush_and_wait(&self) {
        settle(self.inner.flush_all()).await;
    }

    /// Dispatches a single group. A group with nothing buffered is a no-op.
    ///
    /// The shared timer keeps running for the remaining groups; it is only
    /// disarmed when this empties the queue.
    pub fn flush_group(&self, group: &str) {
        self.inner.flush_one(group);
    }

    /// [`flush_group`](Self::flush_group), then waits for that group's handler
    /// calls to settle.
    pub async fn flush_group_and_wait(&self, group: &str) {
        settle(self.inner.flush_one(group)).await;
    }

    /// Waits for every handler call already in flight to settle.
    ///
    /// Does not dispatch anything that is still buffered.
    pub async fn wait(&self) {
        loop {
            let settled = self.inner.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();
            let idle = self.inner.lock_state().in_flight == 0;
            if idle {
                return;
            }
            settled.await;
        }
    }

    /// Number of groups with buffered items.
    pub fn buffered_groups(&self) -> usize {
        self.inner.lock_state().buffers.len()
    }

    /// Number of items buffered under `group`.
    pub fn buffered_len(&self, group: &str) -> usize {
        self.inner
            .lock_state()
            .buffers
            .get(group)
            .map_or(0, Vec::len)
    }

    /// Whether an automatic flush is scheduled.
    pub fn is_timer_armed(&self) -> bool {
        self.inner.lock_state().timer.is_some()
    }

    /// Number of dispatched groups whose handler calls have not settled.
    pub fn in_flight(&self) -> usize {
        self.inner.lock_state().in_flight
    }

    /// The limits this queue was built with.
    pub fn config(&self) -> &ThrottleConfig {
        &self.inner.config
    }
}

impl<T> Shared<T> {
    fn lock_state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send + 'static> Shared<T> {
    fn arm_timer(self: &Arc<Self>, state: &mut State<T>) {
        state.timer_generation += 1;
        let generation = state.timer_generation;
        let delay = self.config.max_delay;
        let shared = Arc::clone(self);

        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.fire_timer(generation);
        }));
        trace!(delay_ms = delay.as_millis(), "flush timer armed");
    }

    fn fire_timer(self: &Arc<Self>, generation: u64) {
        let batches = {
            let mut state = self.lock_state();
            if state.timer_generation != generation || state.timer.is_none() {
                return;
            }
            // This is the timer task itself; dropping the handle just detaches it.
            state.timer = None;
            Self::take_all(&mut state)
        };

        debug!(groups = batches.len(), "automatic flush");
        for (group, items) in batches {
            self.dispatch(group, items);
        }
    }

    fn flush_all(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let batches = {
            let mut state = self.lock_state();
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            Self::take_all(&mut state)
        };

        batches
            .into_iter()
            .map(|(group, items)| self.dispatch(group, items))
            .collect()
    }

    fn flush_one(self: &Arc<Self>, group: &str) -> Option<JoinHandle<()>> {
        let items = {
            let mut state = self.lock_state();
            let items = state.buffers.remove(group)?;
            if state.buffers.is_empty() {
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
            }
            state.in_flight += 1;
            items
        };

        Some(self.dispatch(group.to_owned(), items))
    }

    /// Empties the buffer map, counting every group as in flight before the
    /// lock is released so a concurrent `wait` cannot miss them.
    fn take_all(state: &mut State<T>) -> Vec<(String, Vec<T>)> {
        let batches: Vec<(String, Vec<T>)> = state.buffers.drain().collect();
        state.in_flight += batches.len();
        batches
    }

    /// Spawns delivery of one group's items. The caller has already counted
    /// the group in `in_flight`.
    fn dispatch(self: &Arc<Self>, group: String, items: Vec<T>) -> JoinHandle<()> {
        let guard = InFlight {
            shared: Arc::clone(self),
        };
        tokio::spawn(async move {
            deliver(&guard.shared, group, items).await;
            drop(guard);
        })
    }
}

/// Releases one `in_flight` slot when dropped, even if delivery unwinds.
struct InFlight<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Drop for InFlight<T> {
    fn drop(&mut self) {
        let mut state = self.shared.lock_state();
        state.in_flight = state.in_flight.saturating_sub(1);
        let idle = state.in_flight == 0;
        drop(state);
        if idle {
            self.shared.settled.notify_waiters();
        }
    }
}

/// Feeds `items` to the handler in contiguous batches, one call at a time.
async fn deliver<T: Send + 'static>(shared: &Arc<Shared<T>>, group: String, items: Vec<T>) {
    let total = items.len();
    let batches = into_batches(items, shared.config.batch_limit());
    let count = batches.len();
    debug!(group = %group, items = total, batches = count, "flushing group");

    for (index, batch) in batches.into_iter().enumerate() {
        let handler = Arc::clone(&shared.handler);
        let batch_group = group.clone();
        // Each call runs in its own task so a panicking handler is contained
        // to the batch it was given.
        let outcome = tokio::spawn(async move { handler.call(batch_group, batch).await }).await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(
                    group = %group,
                    batch = index + 1,
                    batches = count,
                    error = %e,
                    "batch handler failed"
                );
            }
            Err(e) if e.is_panic() => {
                error!(
                    group = %group,
                    batch = index + 1,
                    batches = count,
                    "batch handler panicked"
                );
            }
            Err(e) => {
                warn!(group = %group, error = %e, "batch handler was cancelled");
            }
        }
    }
}

/// Splits `items` into contiguous chunks of at most `limit`, preserving order.
fn into_batches<T>(mut items: Vec<T>, limit: usize) -> Vec<Vec<T>> {
    let limit = limit.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(limit));
    while items.len() > limit {
        let rest = items.split_off(limit);
        batches.push(std::mem::replace(&mut items, rest));
    }
    batches.push(items);
    batches
}

async fn settle(handles: impl IntoIterator<Item = JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "flush task did not complete");
        }
    }
}
