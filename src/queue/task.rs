//! Task records and the caller-side completion handle.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::error::{QueueError, Rejection};
use super::signal::AbortSignal;

/// A boxed, `Send` unit future. This is what a lane driver actually executes.
pub(crate) type JobFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Type-erased task record stored in a lane or a debounce slot.
///
/// A record is consumed exactly once: either it runs, or it is rejected.
/// Both paths resolve the caller's [`Completion`].
pub(crate) trait Job: Send + 'static {
    /// Turns the record into the future that runs the operation and reports
    /// its outcome.
    fn run(self: Box<Self>, signal: AbortSignal) -> JobFuture;

    /// Resolves the record's completion with a synthetic error without
    /// running the operation.
    fn reject(self: Box<Self>, rejection: Rejection);
}

/// The concrete record behind [`Job`]: an operation plus the sending half of
/// its completion channel.
pub(crate) struct TaskRecord<Op, T, E> {
    operation: Op,
    completion: oneshot::Sender<Result<T, QueueError<E>>>,
}

impl<Op, Fut, T, E> TaskRecord<Op, T, E>
where
    Op: FnOnce(AbortSignal) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    /// Creates a record and the completion its caller will await.
    pub(crate) fn new(operation: Op) -> (Box<dyn Job>, Completion<T, E>) {
        let (tx, rx) = oneshot::channel();
        let record = Box::new(Self {
            operation,
            completion: tx,
        });
        (record, Completion { rx })
    }
}

impl<Op, Fut, T, E> Job for TaskRecord<Op, T, E>
where
    Op: FnOnce(AbortSignal) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    fn run(self: Box<Self>, signal: AbortSignal) -> JobFuture {
        let Self {
            operation,
            completion,
        } = *self;
        Box::pin(async move {
            let outcome = operation(signal).await.map_err(QueueError::Operation);
            // The caller may have dropped its completion; the work still counts.
            let _ = completion.send(outcome);
        })
    }

    fn reject(self: Box<Self>, rejection: Rejection) {
        let _ = self.completion.send(Err(rejection.into()));
    }
}

/// Caller-visible handle for a scheduled or debounced task.
///
/// Resolves exactly once with the operation's own result, or with one of the
/// queue's synthetic errors. Dropping the handle does not cancel the task;
/// it still runs in its lane.
///
/// # Examples
///
/// ```rust
/// use keylane::queue::KeyedQueue;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let queue = KeyedQueue::new();
/// let completion = queue.schedule("payments/42", || async { Ok::<_, std::io::Error>(7) });
/// assert_eq!(completion.await.unwrap(), 7);
/// # }
/// ```
#[must_use = "dropping a Completion detaches from the task's result"]
#[derive(Debug)]
pub struct Completion<T, E> {
    rx: oneshot::Receiver<Result<T, QueueError<E>>>,
}

impl<T, E> Future for Completion<T, E> {
    type Output = Result<T, QueueError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // Sender dropped without reporting: the operation panicked or its
            // task was torn down with the runtime.
            Poll::Ready(Err(_)) => Poll::Ready(Err(QueueError::Interrupted)),
            Poll::Pending => Poll::Pending,
        }
    }
}
