//! The batch handler a [`GroupedThrottledQueue`](super::GroupedThrottledQueue) flushes into.

use std::future::Future;
use std::pin::Pin;

/// Error type returned by batch handlers. Failures are logged, never retried.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Boxed future returned by [`BatchHandler::call`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'static>>;

/// Receives one batch of items for one group per call.
///
/// Any `Fn(String, Vec<T>) -> impl Future<Output = Result<(), HandlerError>>`
/// that is `Send + Sync + 'static` implements this trait through the blanket
/// impl below, so closures work directly. Implement it by hand for sinks that
/// carry their own state.
///
/// # Examples
///
/// ```rust
/// use keylane::throttle::{BatchHandler, HandlerFuture};
///
/// struct QueryLogSink;
///
/// impl BatchHandler<String> for QueryLogSink {
///     fn call(&self, group: String, items: Vec<String>) -> HandlerFuture {
///         Box::pin(async move {
///             println!("{group}: {} queries", items.len());
///             Ok(())
///         })
///     }
/// }
/// ```
pub trait BatchHandler<T>: Send + Sync + 'static {
    /// Handles `items`, all buffered under `group`, in insertion order.
    fn call(&self, group: String, items: Vec<T>) -> HandlerFuture;
}

impl<T, H, F> BatchHandler<T> for H
where
    H: Fn(String, Vec<T>) -> F + Send + Sync + 'static,
    F: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn call(&self, group: String, items: Vec<T>) -> HandlerFuture {
        Box::pin((self)(group, items))
    }
}
