//! A priority task queue with cooperative cancellation.
//!
//! The queue promotes at most `concurrency` tasks at a time from an ordered
//! backlog, selecting the next task by numeric priority (lower runs first,
//! unprioritized tasks run last), and supports a `@@/flush` barrier that
//! nothing queued after it may be promoted ahead of. See [`queue`] for the
//! actor implementation and [`adapter`] for how cancellation is threaded
//! through a running task.

#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

mod adapter;
mod error;
mod queue;
mod task;

pub use adapter::run_cancelable;
pub use error::{QueueError, TaskError};
pub use queue::{PriorityQueue, ProgressFn, PushFuture, QueueStats, TaskHandle, POLL_INTERVAL};
pub use task::{BoxFuture, Priority, TaskFn, TaskId};
