//! # keylane
//!
//! Keyed asynchronous coordination for Tokio services.
//!
//! - [`KeyedQueue`] — at most one running task per key. Work submitted under
//!   the same key runs strictly in order; different keys never wait on each
//!   other. Supports debouncing, cancelling queued work and cooperative abort.
//! - [`GroupedThrottledQueue`] — buffers items per group and flushes them to a
//!   handler in size-bounded batches, on demand or after a shared delay.
//!
//! Both are in-process and in-memory only. Nothing survives a restart.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use keylane::{GroupedThrottledQueue, HandlerError, KeyedQueue};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let queue = KeyedQueue::new();
//!
//!     // Two overlapping requests for the same payment never interleave.
//!     let settled = queue
//!         .schedule("payments/42", || async { Ok::<_, std::io::Error>("paid") })
//!         .await?;
//!     println!("payment {settled}");
//!
//!     let log = GroupedThrottledQueue::new(|group: String, lines: Vec<String>| async move {
//!         println!("{group}: {} lines", lines.len());
//!         Ok::<(), HandlerError>(())
//!     });
//!     log.add_item("org-1", "GET /members 12ms".to_string());
//!     log.flush_and_wait().await;
//!
//!     // Shutdown: stop queued work, let running work wind down.
//!     queue.abort_all("shutting down");
//!     tokio::time::timeout(Duration::from_secs(10), queue.await_all()).await?;
//!     Ok(())
//! }
//! ```

pub mod queue;
pub mod throttle;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use queue::{AbortSignal, Completion, KeyedQueue, QueueError, QueueSnapshot};
pub use throttle::{BatchHandler, GroupedThrottledQueue, HandlerError, ThrottleConfig};
