//! The Promise-Generator Adapter (spec.md §4.1).
//!
//! The source system gives a cancelable unit of work a single `cancel()`
//! handle regardless of whether the work is a plain async function or a
//! lazy async sequence advanced step by step. In Rust, a `Future` already
//! *is* a suspended state machine — polling it only ever makes progress up
//! to its next `.await`, and dropping it mid-poll stops it exactly at that
//! suspension point. Racing a task's future against a [`CancellationToken`]
//! inside `tokio::select!` therefore reproduces the adapter's contract
//! without a bespoke generator-stepping abstraction: the task stops at its
//! current await, and the queue observes a distinguished canceled failure.
//!
//! This is the same pattern the wider ecosystem uses for cooperative task
//! cancellation (a per-task child token raced against the task body inside
//! `tokio::select!`, biased toward the cancellation arm).

use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::task::BoxFuture;

/// Drive `fut` to completion, unless `token` is canceled first.
///
/// On cancellation, `fut` is dropped at whatever `.await` point it had
/// reached and the distinguished [`TaskError::Canceled`] is returned. This
/// is the single place the adapter's race happens; every task body the
/// queue runs goes through this function.
pub async fn run_cancelable<T>(
    token: &CancellationToken,
    fut: BoxFuture<'_, Result<T, TaskError>>,
) -> Result<T, TaskError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(TaskError::Canceled),
        res = fut => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn completes_normally_when_not_canceled() {
        let token = CancellationToken::new();
        let fut: BoxFuture<'_, Result<u32, TaskError>> = Box::pin(async { Ok(7) });
        assert_eq!(run_cancelable(&token, fut).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn cancels_at_next_suspension_point() {
        let token = CancellationToken::new();
        let child = token.clone();
        let fut: BoxFuture<'_, Result<u32, TaskError>> = Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(7)
        });
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            child.cancel();
        });
        let err = run_cancelable(&token, fut).await.unwrap_err();
        assert!(matches!(err, TaskError::Canceled));
    }

    #[tokio::test]
    async fn synchronous_failure_surfaces_as_rejection() {
        let token = CancellationToken::new();
        let fut: BoxFuture<'_, Result<u32, TaskError>> =
            Box::pin(async { Err(TaskError::Failed("boom".into())) });
        let err = run_cancelable(&token, fut).await.unwrap_err();
        assert!(matches!(err, TaskError::Failed(msg) if msg == "boom"));
    }
}
