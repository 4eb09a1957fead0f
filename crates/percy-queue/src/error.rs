use thiserror::Error;

/// Failure modes surfaced by a queued task's handle.
///
/// `Canceled` is the distinguished sentinel rejection described by the
/// Promise-Generator Adapter: callers match on the variant, never on message
/// text, to tell a cancellation apart from an ordinary task failure.
#[derive(Debug, Error, Clone)]
pub enum TaskError {
    /// The task was canceled, either directly via [`crate::PriorityQueue::cancel`]
    /// or indirectly (an id collision with a later `push`, or `close(true)`).
    #[error("task canceled")]
    Canceled,

    /// The task body returned an application-level error.
    #[error("{0}")]
    Failed(String),

    /// The task body panicked (surfaced via `JoinError` when the body runs on
    /// a spawned task) or its worker was dropped without settling.
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Failure modes of queue-level operations (as opposed to individual tasks).
#[derive(Debug, Error, Clone)]
pub enum QueueError {
    /// The task's own execution failed; see [`TaskError`].
    #[error(transparent)]
    Task(#[from] TaskError),

    /// The queue actor has shut down (its task was dropped or panicked).
    /// Any operation racing the actor's demise observes this.
    #[error("queue actor is gone")]
    ActorGone,
}
