//! The priority task queue (spec.md §4.2).
//!
//! Mirrors the teacher crate's `EngineRuntime`/`run_engine` split: a single
//! actor task owns all mutable queue state (`queued`, `pending`, `running`,
//! `closed`) and is driven by a `tokio::select!` loop over a command channel
//! and a completion channel, exactly like `client-engine::engine`'s
//! `EngineRuntime::run`. The handle type returned to callers
//! ([`PriorityQueue`]) is cheap to clone and holds only a sender — it never
//! touches queue state directly, so every mutation is naturally serialized
//! through the actor, satisfying spec.md §5's single-logical-executor
//! requirement even though the surrounding runtime is multi-threaded.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::adapter::run_cancelable;
use crate::error::{QueueError, TaskError};
use crate::task::{BoxFuture, Priority, TaskFn, TaskId};

/// Minimum polling interval for `idle`/`empty`/`flush`, per spec.md §4.2.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

type ReplyTx = oneshot::Sender<Result<(), QueueError>>;

struct QueuedEntry {
    priority: Priority,
    token: CancellationToken,
    run: TaskFn,
    reply: ReplyTx,
    stop_on_complete: bool,
}

struct PendingEntry {
    token: CancellationToken,
    reply: ReplyTx,
    stop_on_complete: bool,
}

struct Completion {
    id: TaskId,
    result: Result<(), TaskError>,
}

enum Command {
    Push {
        id: TaskId,
        priority: Priority,
        run: TaskFn,
        stop_on_complete: bool,
        reply: oneshot::Sender<Option<TaskHandle>>,
    },
    Cancel {
        id: TaskId,
        reply: oneshot::Sender<()>,
    },
    Has {
        id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    Clear {
        reply: oneshot::Sender<usize>,
    },
    Run {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Open {
        reply: oneshot::Sender<()>,
    },
    Close {
        abort: bool,
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<QueueStats>,
    },
    FlushPosition {
        id: TaskId,
        reply: oneshot::Sender<Option<usize>>,
    },
    SetConcurrency {
        concurrency: usize,
        reply: oneshot::Sender<()>,
    },
}

/// A point-in-time snapshot of queue occupancy, used by the polling loops in
/// `idle`/`empty`/`flush`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Number of tasks waiting to be promoted.
    pub queued: usize,
    /// Number of tasks currently running.
    pub pending: usize,
    /// Whether the scheduler is currently promoting tasks.
    pub running: bool,
}

impl QueueStats {
    /// `queued + pending`, i.e. [`PriorityQueue::size`].
    pub fn size(&self) -> usize {
        self.queued + self.pending
    }
}

/// A handle to a single pushed task's eventual outcome.
///
/// Resolves to `Ok(())` on success, `Err(QueueError::Task(TaskError::Canceled))`
/// if the task was canceled (directly, by an id collision, or by
/// `close(true)`), or the task's own failure otherwise.
pub struct TaskHandle {
    rx: oneshot::Receiver<Result<(), QueueError>>,
}

impl Future for TaskHandle {
    type Output = Result<(), QueueError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            Poll::Ready(Err(_)) => Poll::Ready(Err(QueueError::ActorGone)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Extract a human-readable message from a `JoinError`, for `TaskError::Panicked`.
/// A canceled `JoinHandle` (the actor dropping it) can't happen here — this
/// handle is always joined — so the only error variant reachable is a panic.
fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "task panicked with a non-string payload".to_string()),
        Err(err) => err.to_string(),
    }
}

struct Actor {
    concurrency: usize,
    running: bool,
    closed: bool,
    queued: IndexMap<TaskId, QueuedEntry>,
    pending: std::collections::HashMap<TaskId, PendingEntry>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    // Kept alive so `completion_rx` never observes a sender count of zero
    // merely because no task happens to be in flight right now.
    _completion_tx_keepalive: mpsc::UnboundedSender<Completion>,
}

impl Actor {
    fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self.queued.len(),
            pending: self.pending.len(),
            running: self.running,
        }
    }

    fn next_candidate(&self) -> Option<TaskId> {
        let mut best: Option<&TaskId> = None;
        for (id, entry) in self.queued.iter() {
            let is_better = match best {
                None => true,
                Some(best_id) => {
                    let best_priority = self.queued[best_id].priority;
                    entry.priority.outranks(best_priority)
                }
            };
            if is_better {
                best = Some(id);
            }
            if id.is_sentinel() {
                break;
            }
        }
        best.cloned()
    }

    fn promote_ready(&mut self) {
        while self.running && self.pending.len() < self.concurrency && !self.queued.is_empty() {
            let Some(id) = self.next_candidate() else {
                break;
            };
            let Some((_, entry)) = self.queued.shift_remove_entry(&id) else {
                break;
            };
            let QueuedEntry {
                priority: _,
                token,
                run,
                reply,
                stop_on_complete,
            } = entry;

            self.pending.insert(
                id.clone(),
                PendingEntry {
                    token: token.clone(),
                    reply,
                    stop_on_complete,
                },
            );

            let completion_tx = self._completion_tx_keepalive.clone();
            let task_id = id.clone();
            // Run the task body on its own spawned task so a panic there
            // can't take down the actor, but keep the `JoinHandle` instead
            // of discarding it: a bare discarded spawn would silently drop
            // the completion on panic, leaking this id in `pending` forever
            // (`idle`/`empty`/`size` would never see it clear). Joining here
            // turns a panic into a `TaskError::Panicked` completion instead.
            let join = tokio::spawn(async move {
                let fut: BoxFuture<'static, Result<(), TaskError>> = run();
                run_cancelable(&token, fut).await
            });
            tokio::spawn(async move {
                let result = match join.await {
                    Ok(result) => result,
                    Err(join_err) => Err(TaskError::Panicked(panic_message(join_err))),
                };
                let _ = completion_tx.send(Completion {
                    id: task_id,
                    result,
                });
            });
        }
    }

    fn settle(reply: ReplyTx, result: Result<(), TaskError>) {
        let _ = reply.send(result.map_err(QueueError::from));
    }

    fn cancel_locked(&mut self, id: &TaskId) {
        if let Some(entry) = self.queued.shift_remove(id) {
            Self::settle(entry.reply, Err(TaskError::Canceled));
            return;
        }
        if let Some(entry) = self.pending.remove(id) {
            entry.token.cancel();
            Self::settle(entry.reply, Err(TaskError::Canceled));
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Push {
                id,
                priority,
                run,
                stop_on_complete,
                reply,
            } => {
                if self.closed && !id.is_sentinel() {
                    let _ = reply.send(None);
                    return;
                }
                self.cancel_locked(&id);

                let (tx, rx) = oneshot::channel();
                self.queued.insert(
                    id,
                    QueuedEntry {
                        priority,
                        token: CancellationToken::new(),
                        run,
                        reply: tx,
                        stop_on_complete,
                    },
                );
                let _ = reply.send(Some(TaskHandle { rx }));
                self.promote_ready();
            }
            Command::Cancel { id, reply } => {
                self.cancel_locked(&id);
                let _ = reply.send(());
            }
            Command::Has { id, reply } => {
                let _ = reply.send(self.queued.contains_key(&id) || self.pending.contains_key(&id));
            }
            Command::Clear { reply } => {
                let total = self.queued.len() + self.pending.len();
                for (_, entry) in self.queued.drain(..) {
                    Self::settle(entry.reply, Err(TaskError::Canceled));
                }
                let _ = reply.send(total);
            }
            Command::Run { reply } => {
                self.running = true;
                self.promote_ready();
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                self.running = false;
                let _ = reply.send(());
            }
            Command::Open { reply } => {
                self.closed = false;
                let _ = reply.send(());
            }
            Command::Close { abort, reply } => {
                self.closed = true;
                if abort {
                    self.running = false;
                    for (_, entry) in self.queued.drain(..) {
                        Self::settle(entry.reply, Err(TaskError::Canceled));
                    }
                }
                let _ = reply.send(());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::FlushPosition { id, reply } => {
                let pos = self
                    .queued
                    .get_index_of(&id)
                    .or_else(|| self.pending.contains_key(&id).then_some(0));
                let _ = reply.send(pos);
            }
            Command::SetConcurrency { concurrency, reply } => {
                self.concurrency = concurrency.max(1);
                self.promote_ready();
                let _ = reply.send(());
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        let Completion { id, result } = completion;
        if let Some(entry) = self.pending.remove(&id) {
            if entry.stop_on_complete {
                self.running = false;
            }
            Self::settle(entry.reply, result);
            self.promote_ready();
        }
        // If not found in `pending`, the task was already canceled and
        // settled synchronously by `cancel_locked`; this late completion is
        // a no-op, matching the idempotent-cancel contract.
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => break,
                    }
                }
                comp = self.completion_rx.recv() => {
                    if let Some(comp) = comp {
                        self.handle_completion(comp);
                    }
                }
            }
        }
    }
}

/// Callback invoked once per poll by `idle`/`empty`/`flush`, receiving the
/// relevant occupancy count for that operation.
pub type ProgressFn = Box<dyn FnMut(usize) + Send>;

/// A cheap, cloneable handle to a running priority queue.
///
/// Construction starts a background actor task (see [`Actor`]); dropping
/// every clone of the handle lets the actor exit on its next command poll.
#[derive(Clone)]
pub struct PriorityQueue {
    command_tx: mpsc::UnboundedSender<Command>,
}

impl PriorityQueue {
    /// Start a new queue with the given concurrency (tasks promoted from
    /// `queued` to `pending` at once). `concurrency` is clamped to at least 1.
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            concurrency,
            running: false,
            closed: false,
            queued: IndexMap::new(),
            pending: std::collections::HashMap::new(),
            command_rx,
            completion_rx,
            _completion_tx_keepalive: completion_tx,
        };
        tokio::spawn(actor.run());

        Self { command_tx }
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> T
    where
        T: Default,
    {
        let (tx, rx) = oneshot::channel();
        if self.command_tx.send(build(tx)).is_err() {
            return T::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Push a task, canceling any existing task with the same id first.
    ///
    /// Returns `None` if the queue is closed and `id` is not a `@@/`-prefixed
    /// sentinel (the silent-drop rule of spec.md §4.2), `Some(handle)`
    /// otherwise.
    pub fn push<F, Fut>(&self, id: impl Into<TaskId>, priority: impl Into<Priority>, run: F) -> PushFuture
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let boxed: TaskFn = Box::new(move || -> BoxFuture<'static, Result<(), TaskError>> { Box::pin(run()) });
        self.push_boxed(id.into(), priority.into(), boxed, false)
    }

    fn push_boxed(&self, id: TaskId, priority: Priority, run: TaskFn, stop_on_complete: bool) -> PushFuture {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .command_tx
            .send(Command::Push {
                id,
                priority,
                run,
                stop_on_complete,
                reply: tx,
            })
            .is_ok();
        PushFuture {
            rx: if sent { Some(rx) } else { None },
        }
    }

    /// Cancel the task with `id`, if queued or pending. Idempotent.
    pub async fn cancel(&self, id: impl Into<TaskId>) {
        self.call(|reply| Command::Cancel {
            id: id.into(),
            reply,
        })
        .await
    }

    /// True iff `id` is currently queued or pending.
    pub async fn has(&self, id: impl Into<TaskId>) -> bool {
        self.call(|reply| Command::Has {
            id: id.into(),
            reply,
        })
        .await
    }

    /// Drain only `queued` (pending tasks keep running); returns the prior
    /// total size (`queued + pending` before the drain).
    pub async fn clear(&self) -> usize {
        self.call(|reply| Command::Clear { reply }).await
    }

    /// `queued + pending`.
    pub async fn size(&self) -> usize {
        self.stats().await.size()
    }

    /// Start (or resume) promoting tasks.
    pub async fn run(&self) {
        self.call(|reply| Command::Run { reply }).await
    }

    /// Stop promoting tasks; tasks already running are left alone.
    pub async fn stop(&self) {
        self.call(|reply| Command::Stop { reply }).await
    }

    /// Reopen the queue to non-sentinel pushes.
    pub async fn open(&self) {
        self.call(|reply| Command::Open { reply }).await
    }

    /// Close the queue to non-sentinel pushes. `abort=true` additionally
    /// stops the scheduler and cancels every queued task.
    pub async fn close(&self, abort: bool) {
        self.call(|reply| Command::Close { abort, reply }).await
    }

    async fn stats(&self) -> QueueStats {
        self.call(|reply| Command::Stats { reply }).await
    }

    /// Change `concurrency` at runtime (clamped to at least 1), promoting
    /// more tasks immediately if the new value raised the limit. Percy's
    /// `setConfig` applies this to both of its queues together when
    /// `discovery.concurrency` changes.
    pub async fn set_concurrency(&self, concurrency: usize) {
        self.call(|reply| Command::SetConcurrency { concurrency, reply }).await
    }

    /// Wait until no task is pending, polling at [`POLL_INTERVAL`] and
    /// invoking `cb(pending_count)` on each poll.
    pub async fn idle(&self, mut cb: Option<ProgressFn>) {
        loop {
            let stats = self.stats().await;
            if let Some(cb) = cb.as_mut() {
                cb(stats.pending);
            }
            if stats.pending == 0 {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until the queue is completely empty (`size() == 0`), same
    /// polling shape as [`PriorityQueue::idle`].
    pub async fn empty(&self, mut cb: Option<ProgressFn>) {
        loop {
            let stats = self.stats().await;
            if let Some(cb) = cb.as_mut() {
                cb(stats.size());
            }
            if stats.size() == 0 {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Ensure the queue is running, push the `@@/flush` barrier, and wait
    /// for it (and everything queued ahead of it) to drain.
    ///
    /// If the queue was stopped when `flush` was called, it is restored to
    /// stopped once the barrier itself completes — `flush` only promises to
    /// drain what is there *right now*, it does not leave the queue running
    /// forever. If `cancel` fires first, the barrier is canceled and the
    /// queue's running state is restored immediately.
    pub async fn flush(&self, mut cb: Option<ProgressFn>, cancel: &CancellationToken) -> Result<(), QueueError> {
        let was_running = self.stats().await.running;
        if !was_running {
            self.run().await;
        }

        let handle = self.push_boxed(
            TaskId::flush_barrier(),
            Priority::NONE,
            Box::new(|| Box::pin(async { Ok(()) })),
            !was_running,
        );
        let Some(mut handle) = handle.await else {
            return Ok(());
        };

        loop {
            let pending = self.stats().await.pending;
            let position = self
                .call::<Option<usize>>(|reply| Command::FlushPosition {
                    id: TaskId::flush_barrier(),
                    reply,
                })
                .await;
            let Some(position) = position else {
                // Barrier already promoted to pending and then completed.
                break;
            };
            if let Some(cb) = cb.as_mut() {
                cb(pending + position);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.cancel(TaskId::flush_barrier()).await;
                    if !was_running {
                        self.stop().await;
                    }
                    return Err(QueueError::Task(TaskError::Canceled));
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                res = &mut handle => {
                    return res;
                }
            }
        }

        (&mut handle).await
    }
}

/// The future returned by [`PriorityQueue::push`]: resolves to `None` if the
/// queue silently dropped the push (closed, non-sentinel id), `Some(handle)`
/// otherwise.
pub struct PushFuture {
    rx: Option<oneshot::Receiver<Option<TaskHandle>>>,
}

impl Future for PushFuture {
    type Output = Option<TaskHandle>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(None);
        };
        match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(handle)) => Poll::Ready(handle),
            Poll::Ready(Err(_)) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Default for QueueStats {
    fn default() -> Self {
        Self {
            queued: 0,
            pending: 0,
            running: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    #[tokio::test]
    async fn runs_tasks_in_priority_order() {
        let queue = PriorityQueue::new(1);
        let order = Arc::new(AsyncMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (id, prio) in [("c", None), ("a", Some(1)), ("b", Some(2))] {
            let order = order.clone();
            let handle = queue.push(id, prio, move || {
                let order = order.clone();
                async move {
                    order.lock().await.push(id.to_string());
                    Ok(())
                }
            });
            handles.push(handle.await.unwrap());
        }

        queue.run().await;
        queue.idle(None).await;
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn cancel_settles_a_queued_task() {
        let queue = PriorityQueue::new(1);
        let handle = queue
            .push("only", None, || async { Ok(()) })
            .await
            .unwrap();

        queue.cancel("only").await;
        let err = handle.await.unwrap_err();
        assert!(matches!(err, QueueError::Task(TaskError::Canceled)));
    }

    #[tokio::test]
    async fn pushing_the_same_id_cancels_the_prior_task() {
        let queue = PriorityQueue::new(1);
        let first = queue.push("dup", None, || async { Ok(()) }).await.unwrap();
        let second = queue.push("dup", None, || async { Ok(()) }).await.unwrap();

        queue.run().await;
        queue.idle(None).await;

        assert!(matches!(
            first.await.unwrap_err(),
            QueueError::Task(TaskError::Canceled)
        ));
        second.await.unwrap();
    }

    #[tokio::test]
    async fn closed_queue_silently_drops_non_sentinel_pushes() {
        let queue = PriorityQueue::new(1);
        queue.close(false).await;

        let handle = queue.push("blocked", None, || async { Ok(()) }).await;
        assert!(handle.is_none());
        assert_eq!(queue.size().await, 0);
    }

    #[tokio::test]
    async fn close_abort_cancels_queued_but_not_pending() {
        let queue = PriorityQueue::new(1);
        let started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());

        let running = {
            let started = started.clone();
            let release = release.clone();
            queue
                .push("running", None, move || async move {
                    started.notify_one();
                    release.notified().await;
                    Ok(())
                })
                .await
                .unwrap()
        };
        queue.run().await;
        started.notified().await;

        let queued = queue
            .push("queued", None, || async { Ok(()) })
            .await
            .unwrap();

        queue.close(true).await;
        assert!(matches!(
            queued.await.unwrap_err(),
            QueueError::Task(TaskError::Canceled)
        ));

        release.notify_one();
        running.await.unwrap();
    }

    #[tokio::test]
    async fn flush_drains_everything_queued_ahead_of_the_barrier() {
        let queue = PriorityQueue::new(1);
        let completed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let completed = completed.clone();
            let handle = queue
                .push(format!("t{}", completed.load(Ordering::SeqCst)), None, move || {
                    let completed = completed.clone();
                    async move {
                        completed.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await
                .unwrap();
            handles.push(handle);
        }

        let token = CancellationToken::new();
        queue.flush(None, &token).await.unwrap();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(completed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn flush_restores_a_prior_stopped_state() {
        let queue = PriorityQueue::new(1);
        let token = CancellationToken::new();

        queue.flush(None, &token).await.unwrap();

        assert!(!queue.stats().await.running);
    }

    #[tokio::test]
    async fn canceling_flush_restores_running_state_immediately() {
        // The queue is stopped when `flush` is called, so `flush` starts it
        // itself; canceling should put it right back to stopped rather than
        // leaving it running.
        let queue = PriorityQueue::new(1);
        let blocker_started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());

        let blocker = {
            let blocker_started = blocker_started.clone();
            let release = release.clone();
            queue
                .push("blocker", None, move || async move {
                    blocker_started.notify_one();
                    release.notified().await;
                    Ok(())
                })
                .await
                .unwrap()
        };

        let token = CancellationToken::new();
        let flush_token = token.clone();
        let queue_for_flush = queue.clone();
        let flush = tokio::spawn(async move { queue_for_flush.flush(None, &flush_token).await });

        blocker_started.notified().await;
        token.cancel();
        let result = flush.await.unwrap();
        assert!(matches!(
            result.unwrap_err(),
            QueueError::Task(TaskError::Canceled)
        ));
        assert!(!queue.stats().await.running);

        release.notify_one();
        blocker.await.unwrap();
    }

    #[tokio::test]
    async fn raising_concurrency_promotes_additional_queued_tasks() {
        let queue = PriorityQueue::new(1);
        let started = Arc::new(AtomicUsize::new(0));
        let releases: Vec<_> = (0..3).map(|_| Arc::new(tokio::sync::Notify::new())).collect();
        let mut handles = Vec::new();
        for (i, release) in releases.iter().enumerate() {
            let started = started.clone();
            let release = release.clone();
            let handle = queue
                .push(format!("t{i}"), None, move || {
                    let started = started.clone();
                    async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        release.notified().await;
                        Ok(())
                    }
                })
                .await
                .unwrap();
            handles.push(handle);
        }

        queue.run().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        queue.set_concurrency(3).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(started.load(Ordering::SeqCst), 3);

        for release in &releases {
            release.notify_one();
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn a_panicking_task_settles_as_panicked_instead_of_leaking_a_pending_slot() {
        let queue = PriorityQueue::new(1);
        let handle = queue
            .push("boom", None, || async { panic!("task exploded") })
            .await
            .unwrap();

        queue.run().await;
        let err = handle.await.unwrap_err();
        assert!(matches!(err, QueueError::Task(TaskError::Panicked(_))));

        queue.idle(None).await;
        assert_eq!(queue.stats().await.pending, 0);
    }

    #[tokio::test]
    async fn clear_returns_prior_total_and_leaves_pending_running() {
        let queue = PriorityQueue::new(1);
        let started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());

        let running = {
            let started = started.clone();
            let release = release.clone();
            queue
                .push("running", None, move || async move {
                    started.notify_one();
                    release.notified().await;
                    Ok(())
                })
                .await
                .unwrap()
        };
        queue.run().await;
        started.notified().await;

        let queued = queue
            .push("queued", None, || async { Ok(()) })
            .await
            .unwrap();

        let total = queue.clear().await;
        assert_eq!(total, 2);
        assert!(matches!(
            queued.await.unwrap_err(),
            QueueError::Task(TaskError::Canceled)
        ));

        release.notify_one();
        running.await.unwrap();
    }
}
