use std::future::Future;
use std::pin::Pin;

use crate::error::TaskError;

/// A future boxed for storage in the queue actor.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A task body: invoked once, at promotion time, to produce the future the
/// queue then drives to completion (racing it against cancellation).
///
/// Plain one-shot work and long multi-step work (discovery, which performs
/// many awaited sub-steps) are both represented by this single shape — see
/// `percy-queue::adapter` for why that collapse is sound in Rust.
pub type TaskFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), TaskError>> + Send>;

/// Stable identifier for a queued task.
///
/// Ids beginning with `@@/` are reserved for queue-internal sentinels (only
/// [`TaskId::flush_barrier`] is defined today); application ids are free to
/// use any other string, including the `build/create`, `snapshot/<name>`,
/// and `upload/<name>` conventions `percy-core` builds on top of this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(String);

impl TaskId {
    /// Build a task id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The sentinel id used for the flush barrier (§4.2).
    pub fn flush_barrier() -> Self {
        Self("@@/flush".to_string())
    }

    /// True for `@@/`-prefixed ids, which are immune to the closed-queue
    /// silent-drop rule in [`crate::PriorityQueue::push`].
    pub fn is_sentinel(&self) -> bool {
        self.0.starts_with("@@/")
    }

    /// Borrow the id as a plain string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// A task's scheduling priority. Lower values run earlier; `None` ranks
/// after every numerically-prioritized task (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority(pub Option<i64>);

impl Priority {
    /// The default, lowest-ranked priority.
    pub const NONE: Priority = Priority(None);

    /// `true` if `self` should be promoted ahead of `other` under the
    /// selection rule in spec.md §4.2:
    ///
    /// `T` replaces the current best candidate `C` iff `C` is absent, or `T`
    /// has a numeric priority while `C` doesn't, or `T`'s numeric priority is
    /// strictly less than `C`'s. Ties resolve by insertion order upstream
    /// (the scan never calls this for equal priorities that should tie).
    pub(crate) fn outranks(self, other: Priority) -> bool {
        match (self.0, other.0) {
            (Some(a), Some(b)) => a < b,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => false,
        }
    }
}

impl From<Option<i64>> for Priority {
    fn from(value: Option<i64>) -> Self {
        Priority(value)
    }
}

impl From<i64> for Priority {
    fn from(value: i64) -> Self {
        Priority(Some(value))
    }
}
