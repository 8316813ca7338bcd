//! Errors surfaced through a [`Completion`](super::Completion).

use thiserror::Error;

/// Outcome of a keyed task that did not produce a success value.
///
/// `Operation` carries the operation's own error untouched. Every other
/// variant is a coordination signal raised by the queue itself and never
/// originates from user code.
#[derive(Debug, Error)]
pub enum QueueError<E> {
    /// The submitted operation ran and returned this error.
    #[error("operation failed: {0}")]
    Operation(E),

    /// Removed from its lane by [`KeyedQueue::cancel`](super::KeyedQueue::cancel)
    /// before it started.
    #[error("task cancelled before it started")]
    Cancelled,

    /// Replaced by a later `debounce` call on the same key before its delay
    /// elapsed.
    #[error("superseded by a later debounced call")]
    Debounced,

    /// Removed from its lane by an abort request before it started.
    #[error("task aborted: {reason}")]
    Aborted { reason: String },

    /// The task was dropped without reporting a result, e.g. the operation
    /// panicked or the runtime shut down underneath it.
    #[error("task interrupted before reporting a result")]
    Interrupted,
}

impl<E> QueueError<E> {
    /// Returns `true` if the task was cancelled while still queued.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if the call was superseded by a later `debounce`.
    ///
    /// Callers usually treat this as an expected outcome rather than a failure.
    pub fn is_debounced(&self) -> bool {
        matches!(self, Self::Debounced)
    }

    /// Returns `true` if the task was aborted while still queued.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Returns the operation's own error, if that is what this is.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }
}

/// Synthetic rejection applied to a task record that will never run.
#[derive(Debug, Clone)]
pub(crate) enum Rejection {
    Cancelled,
    Debounced,
    Aborted(String),
}

impl<E> From<Rejection> for QueueError<E> {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::Cancelled => Self::Cancelled,
            Rejection::Debounced => Self::Debounced,
            Rejection::Aborted(reason) => Self::Aborted { reason },
        }
    }
}
