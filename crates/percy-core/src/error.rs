use percy_queue::{QueueError, TaskError};
use thiserror::Error;

/// Error taxonomy for the Percy core (spec.md §7), minus `ConfigInvalid`
/// (never fatal — it's just a warn-level log line, see `percy::Percy`) and
/// `SnapshotError`/`UploadError` (both per-snapshot; they're logged and
/// swallowed rather than surfaced through this type — see
/// `Percy::take_snapshot`).
#[derive(Debug, Error)]
pub enum PercyError {
    /// The distinguished cancellation rejection. Callers match on the
    /// variant, never on message text, per spec.md's "distinguished
    /// canceled failure".
    #[error("operation canceled")]
    Canceled,

    /// Build creation failed, or a prior upload poisoned the build (a 422
    /// response pointing at `/data/attributes/build`).
    #[error("build error: {0}")]
    Build(String),

    /// `start()`'s server failed to bind because the port was already in
    /// use (spec.md §7's `BindError`, remapped from the underlying I/O
    /// error into a friendlier message).
    #[error("{0}")]
    Bind(String),

    /// A queued task failed for a reason other than cancellation.
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// Any other collaborator failure (browser launch, server listen,
    /// snapshot gathering at the top level).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<QueueError> for PercyError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Task(TaskError::Canceled) => PercyError::Canceled,
            QueueError::Task(TaskError::Failed(msg)) => PercyError::TaskFailed(msg),
            QueueError::Task(TaskError::Panicked(msg)) => {
                PercyError::Other(anyhow::anyhow!("task panicked: {msg}"))
            }
            QueueError::ActorGone => PercyError::Other(anyhow::anyhow!("queue actor is gone")),
        }
    }
}

impl PercyError {
    /// True for the distinguished canceled rejection specifically (as
    /// opposed to any other `TaskFailed`/`Other` failure).
    pub fn is_canceled(&self) -> bool {
        matches!(self, PercyError::Canceled)
    }

    /// Remap an `EADDRINUSE`-shaped I/O failure into [`PercyError::Bind`],
    /// per spec.md §4.4's "`EADDRINUSE` is remapped to a friendlier
    /// message." Any other failure passes through as [`PercyError::Other`].
    pub(crate) fn from_listen_failure(err: anyhow::Error) -> Self {
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            if io_err.kind() == std::io::ErrorKind::AddrInUse {
                return PercyError::Bind(format!(
                    "port already in use — is another Percy process running? ({io_err})"
                ));
            }
        }
        PercyError::Other(err)
    }
}
