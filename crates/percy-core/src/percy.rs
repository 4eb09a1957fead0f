//! The top-level state machine (spec.md §4.4): owns both priority queues, the
//! build record, and the ready-state machine, and orchestrates build
//! creation, per-snapshot discovery, and upload scheduling against the
//! external collaborators in [`crate::traits`].

use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use percy_logger::Logger;
use percy_queue::{BoxFuture, Priority, PriorityQueue, ProgressFn, QueueError, TaskError};

use crate::error::PercyError;
use crate::options::{BuildState, Options, ReadyState};
use crate::traits::{
    BrowserDriver, OnSnapshotDone, OptionsValidator, PercyContext, RemoteClient,
    ResourceDiscoverer, ServerHandle, Snapshot, SnapshotGatherer, SnapshotInput, SnapshotOptions,
    SnapshotPayload, StaticFileServer,
};

/// The pieces a queued task body needs, cloned into its `move` closure
/// instead of capturing the whole [`Percy`] (which would otherwise need to
/// be `Clone` itself and would pull the trait objects held only by the
/// top-level struct into every task). Mirrors the teacher's habit of
/// passing a small cloneable context into spawned work rather than the
/// owning struct (`client-engine::engine::EngineInner`).
#[derive(Clone)]
struct Shared {
    options: Arc<Options>,
    logger: Logger,
    build: Arc<Mutex<BuildState>>,
    ready_state: Arc<Mutex<Option<ReadyState>>>,
    client: Arc<dyn RemoteClient>,
    snapshots_queue: PriorityQueue,
    uploads_queue: PriorityQueue,
}

/// The Percy state machine. Construct with [`Percy::new`], then drive it
/// through `start` → `snapshot`* → `stop`/`close`.
pub struct Percy {
    shared: Shared,
    browser: Option<Arc<dyn BrowserDriver>>,
    server: Option<Arc<dyn ServerHandle>>,
    static_server: Option<Arc<dyn StaticFileServer>>,
    gatherer: Arc<dyn SnapshotGatherer>,
    discoverer: Arc<dyn ResourceDiscoverer>,
    validator: Arc<dyn OptionsValidator>,
}

impl Percy {
    /// Build a new, unstarted Percy instance. `options` is normalized
    /// (`dry_run ⇒ skip_uploads ⇒ defer_uploads`) before either queue is
    /// constructed, since both are created with `options.concurrency()`.
    /// `static_server` is optional: a `snapshot()` call whose options set
    /// `serve` is a no-op (aside from the flag itself) if none was supplied.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mut options: Options,
        logger: Logger,
        client: Arc<dyn RemoteClient>,
        gatherer: Arc<dyn SnapshotGatherer>,
        discoverer: Arc<dyn ResourceDiscoverer>,
        validator: Arc<dyn OptionsValidator>,
        browser: Option<Arc<dyn BrowserDriver>>,
        server: Option<Arc<dyn ServerHandle>>,
        static_server: Option<Arc<dyn StaticFileServer>>,
    ) -> Self {
        options.normalize();
        let concurrency = options.concurrency();
        let shared = Shared {
            options: Arc::new(options),
            logger,
            build: Arc::new(Mutex::new(BuildState::default())),
            ready_state: Arc::new(Mutex::new(None)),
            client,
            snapshots_queue: PriorityQueue::new(concurrency),
            uploads_queue: PriorityQueue::new(concurrency),
        };
        Self {
            shared,
            browser,
            server,
            static_server,
            gatherer,
            discoverer,
            validator,
        }
    }

    pub fn ready_state(&self) -> Option<ReadyState> {
        *self.shared.ready_state.lock().unwrap()
    }

    fn set_ready_state(&self, state: Option<ReadyState>) {
        *self.shared.ready_state.lock().unwrap() = state;
    }

    /// A snapshot of the current build record.
    pub fn build(&self) -> BuildState {
        self.shared.build.lock().unwrap().clone()
    }

    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    pub fn logger(&self) -> &Logger {
        &self.shared.logger
    }

    pub fn snapshots_queue(&self) -> &PriorityQueue {
        &self.shared.snapshots_queue
    }

    pub fn uploads_queue(&self) -> &PriorityQueue {
        &self.shared.uploads_queue
    }

    /// Apply a new concurrency to both queues together (spec.md §4.4:
    /// "Both queues adopt the same concurrency and are updated together by
    /// `setConfig`").
    pub async fn set_concurrency(&self, concurrency: usize) {
        self.shared.snapshots_queue.set_concurrency(concurrency).await;
        self.shared.uploads_queue.set_concurrency(concurrency).await;
    }

    fn context(&self) -> PercyContext {
        PercyContext {
            options: self.shared.options.clone(),
            logger: self.shared.logger.clone(),
            build: self.shared.build.clone(),
        }
    }

    fn push_build_create(&self) -> percy_queue::PushFuture {
        let shared = self.shared.clone();
        self.shared
            .uploads_queue
            .push("build/create", 0i64, move || async move {
                shared.uploads_queue.stop().await;
                match shared.client.create_build().await {
                    Ok(info) => {
                        {
                            let mut build = shared.build.lock().unwrap();
                            build.id = Some(info.id.clone());
                            build.number = Some(info.number);
                            build.url = Some(info.url.clone());
                        }
                        shared
                            .logger
                            .info(format!("Created build #{}: {}", info.number, info.url));
                        shared.uploads_queue.run().await;
                        Ok(())
                    }
                    Err(err) => {
                        let message = err.to_string();
                        {
                            let mut build = shared.build.lock().unwrap();
                            build.error = Some(message.clone());
                        }
                        shared.logger.error(format!("Failed to create build: {message}"));
                        Err(TaskError::Failed(message))
                    }
                }
            })
    }

    /// Idempotent; see spec.md §4.4 steps 1-7.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), PercyError> {
        if self.ready_state().is_some() {
            return Ok(());
        }
        self.set_ready_state(Some(ReadyState::Starting));

        let Some(handle) = self.push_build_create().await else {
            self.set_ready_state(None);
            return Err(PercyError::Other(anyhow::anyhow!(
                "uploads queue was closed before build/create could be scheduled"
            )));
        };

        if self.shared.options.defer_uploads {
            // Deferred mode: the uploads queue stays stopped, so build/create
            // just sits in `queued` until something runs the queue (flush or
            // stop). Attach a failure handler per spec.md §4.4 step 3 for the
            // case where it does eventually run and fails.
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(err) = handle.await {
                    if !matches!(err, QueueError::Task(TaskError::Canceled)) {
                        shared.logger.error(format!("build failed: {err}"));
                        shared.uploads_queue.close(true).await;
                        shared.snapshots_queue.close(true).await;
                    }
                }
            });
        } else {
            self.shared.uploads_queue.run().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.shared.uploads_queue.cancel("build/create").await;
                    self.set_ready_state(None);
                    return Err(PercyError::Canceled);
                }
                result = handle => {
                    if let Err(err) = result {
                        self.set_ready_state(Some(ReadyState::Stopped));
                        return Err(err.into());
                    }
                }
            }
        }

        if self.shared.options.should_launch_browser() {
            if let Some(browser) = &self.browser {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return self.fail_start(PercyError::Canceled).await,
                    result = browser.launch() => {
                        if let Err(err) = result {
                            return self.fail_start(PercyError::Other(err)).await;
                        }
                    }
                }
            }
        }

        if let Some(server) = &self.server {
            let port = self.shared.options.port;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.fail_start(PercyError::Canceled).await,
                result = server.listen(port) => {
                    if let Err(err) = result {
                        return self.fail_start(PercyError::from_listen_failure(err)).await;
                    }
                }
            }
        }

        // The uploads queue is already running by this point (started above,
        // or left for the deferred failure handler to deal with); the
        // snapshots queue has no equivalent gate, so it starts here.
        self.shared.snapshots_queue.run().await;

        self.set_ready_state(Some(ReadyState::Running));
        self.shared.logger.info("Percy has started!");
        Ok(())
    }

    /// Roll back a failed (or canceled) browser-launch/server-listen step:
    /// close whatever came up, mark stopped, and propagate `err`.
    async fn fail_start(&self, err: PercyError) -> Result<(), PercyError> {
        if let Some(server) = &self.server {
            let _ = server.close().await;
        }
        if let Some(browser) = &self.browser {
            let _ = browser.close().await;
        }
        self.set_ready_state(Some(ReadyState::Stopped));
        Err(err)
    }

    /// Accepts a bare URL, a `.xml` sitemap URL, a fully-specified
    /// [`SnapshotOptions`], or (recursively) an array of any of those.
    /// Resolves once every gathered snapshot has been accepted by the
    /// snapshots queue — not when discovery or uploads finish.
    pub async fn snapshot(
        &self,
        input: impl Into<SnapshotInput>,
        cancel: &CancellationToken,
    ) -> Result<(), PercyError> {
        if self.ready_state() != Some(ReadyState::Running) {
            return Err(PercyError::Other(anyhow::anyhow!("Percy has not started")));
        }
        if let Some(error) = self.shared.build.lock().unwrap().error.clone() {
            return Err(PercyError::Build(error));
        }
        self.snapshot_input(input.into(), cancel).await
    }

    fn snapshot_input<'a>(
        &'a self,
        input: SnapshotInput,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), PercyError>> {
        Box::pin(async move {
            match input {
                SnapshotInput::Many(items) => {
                    let results =
                        join_all(items.into_iter().map(|item| self.snapshot_input(item, cancel))).await;
                    for result in results {
                        result?;
                    }
                    Ok(())
                }
                SnapshotInput::Url(url) => {
                    self.gather_and_take(
                        SnapshotOptions {
                            url: Some(url),
                            ..Default::default()
                        },
                        cancel,
                    )
                    .await
                }
                SnapshotInput::Sitemap(sitemap) => {
                    self.gather_and_take(
                        SnapshotOptions {
                            sitemap: Some(sitemap),
                            ..Default::default()
                        },
                        cancel,
                    )
                    .await
                }
                SnapshotInput::Options(options) => self.gather_and_take(options, cancel).await,
            }
        })
    }

    async fn gather_and_take(
        &self,
        mut options: SnapshotOptions,
        cancel: &CancellationToken,
    ) -> Result<(), PercyError> {
        if let Some(path) = options.serve.clone() {
            if let Some(static_server) = &self.static_server {
                let base_url = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(PercyError::Canceled),
                    result = static_server.serve(&path) => result.map_err(PercyError::Other)?,
                };
                self.shared.logger.debug(format!("serving {} at {base_url}", path.display()));
                options.base_url = Some(base_url);
            }
        }

        let options = self
            .validator
            .validate_snapshot_options(options)
            .map_err(PercyError::Other)?;
        let ctx = self.context();
        let snapshots = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PercyError::Canceled),
            result = self.gatherer.gather_snapshots(&ctx, options) => result.map_err(PercyError::Other)?,
        };
        for snapshot in snapshots {
            self.take_snapshot(snapshot).await;
        }
        Ok(())
    }

    /// Cancels any prior `snapshot/<name>` and related `upload/<name>`
    /// tasks (including `additional_snapshots`), then pushes a fresh
    /// snapshots-queue task delegating to discovery. In dry-run mode,
    /// discovery never runs at all (spec.md §4.4: dry run "also skips
    /// browser launch and discovery"); instead a placeholder upload entry
    /// is queued purely so `stop()`'s snapshot count is accurate, and it
    /// never executes because the uploads queue is never run while
    /// `skip_uploads` holds.
    async fn take_snapshot(&self, snapshot: Snapshot) {
        let snapshot_id = format!("snapshot/{}", snapshot.name);
        self.shared.snapshots_queue.cancel(snapshot_id.clone()).await;
        for sub_name in std::iter::once(snapshot.name.clone()).chain(snapshot.additional_snapshots.iter().cloned()) {
            self.shared.uploads_queue.cancel(format!("upload/{sub_name}")).await;
        }

        if self.shared.options.dry_run {
            let handle = self
                .shared
                .uploads_queue
                .push(format!("upload/{}", snapshot.name), Priority::NONE, || async { Ok(()) })
                .await;
            if let Some(handle) = handle {
                tokio::spawn(async move {
                    let _ = handle.await;
                });
            }
            return;
        }

        let shared = self.shared.clone();
        let discoverer = self.discoverer.clone();
        let ctx = self.context();
        let logger = self.shared.logger.clone();
        let snapshot_name = snapshot.name.clone();

        let handle = self
            .shared
            .snapshots_queue
            .push(snapshot_id, Priority::NONE, move || async move {
                // `on_done` is necessarily synchronous (it's invoked from
                // inside an external trait impl we don't control), so
                // completed sub-snapshots are funneled through a channel and
                // only actually scheduled once discovery itself has
                // returned — this keeps "discovery completes before its
                // upload is scheduled" (spec.md §5) true without requiring
                // discovery to know anything about the uploads queue.
                let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<SnapshotPayload>();
                let on_done: OnSnapshotDone = Box::new(move |payload: SnapshotPayload| {
                    let _ = tx.send(payload);
                });
                let result = discoverer
                    .discover_snapshot_resources(&ctx, &snapshot, &on_done)
                    .await;
                drop(on_done);

                let mut payloads = Vec::new();
                while let Ok(payload) = rx.try_recv() {
                    payloads.push(payload);
                }
                for payload in payloads {
                    let _ = schedule_upload_on(&shared, payload).await;
                }

                result.map_err(|err| TaskError::Failed(err.to_string()))
            })
            .await;

        if let Some(handle) = handle {
            tokio::spawn(async move {
                if let Err(err) = handle.await {
                    match err {
                        QueueError::Task(TaskError::Canceled) => {
                            logger.warn(format!(
                                "duplicate snapshot name {snapshot_name}, previous was canceled"
                            ));
                        }
                        other => {
                            logger.error(format!("snapshot {snapshot_name} failed: {other}"));
                        }
                    }
                }
            });
        }
    }

    /// (a) yields one scheduler tick so synchronous `snapshot()` calls made
    /// just before `flush` have a chance to enqueue; (b) drains the
    /// snapshots queue if non-empty; (c) drains the uploads queue if
    /// uploads are allowed, it holds more than just `build/create`.
    /// Cancellation reopens both queues before propagating.
    pub async fn flush(&self, close: bool, cancel: &CancellationToken) -> Result<(), PercyError> {
        tokio::task::yield_now().await;

        if self.shared.snapshots_queue.size().await > 0 {
            if close {
                self.shared.snapshots_queue.close(false).await;
            }
            let logger = self.shared.logger.clone();
            let cb: ProgressFn = Box::new(move |n| logger.progress(format!("Processing {n} snapshots..."), true));
            if let Err(err) = self.shared.snapshots_queue.flush(Some(cb), cancel).await {
                self.reopen_queues().await;
                return Err(err.into());
            }
            self.shared.logger.progress_done();
        }

        let uploads_allowed = !self.shared.options.skip_uploads;
        if uploads_allowed {
            let size = self.shared.uploads_queue.size().await;
            let only_build_create = size == 1 && self.shared.uploads_queue.has("build/create").await;
            if size > 0 && !only_build_create {
                if close {
                    self.shared.uploads_queue.close(false).await;
                }
                let logger = self.shared.logger.clone();
                let cb: ProgressFn = Box::new(move |n| logger.progress(format!("Uploading {n} snapshots..."), true));
                if let Err(err) = self.shared.uploads_queue.flush(Some(cb), cancel).await {
                    self.reopen_queues().await;
                    return Err(err.into());
                }
                self.shared.logger.progress_done();
            }
        }

        Ok(())
    }

    async fn reopen_queues(&self) {
        self.shared.snapshots_queue.open().await;
        self.shared.uploads_queue.open().await;
    }

    /// See spec.md §4.4. `force` closes both queues immediately, aborting
    /// all pending work, before the usual flush/teardown sequence.
    pub async fn stop(&self, force: bool, cancel: &CancellationToken) -> Result<(), PercyError> {
        let state = self.ready_state();
        if state.is_none() {
            if let Some(browser) = &self.browser {
                if browser.is_connected() {
                    let _ = browser.close().await;
                }
            }
            return Ok(());
        }
        if state == Some(ReadyState::Stopped) {
            return Ok(());
        }
        if force {
            self.shared.snapshots_queue.close(true).await;
            self.shared.uploads_queue.close(true).await;
        }
        if state == Some(ReadyState::Stopping) {
            return Ok(());
        }
        self.set_ready_state(Some(ReadyState::Stopping));

        if let Err(err) = self.flush(true, cancel).await {
            if err.is_canceled() {
                self.set_ready_state(Some(ReadyState::Running));
            }
            return Err(err);
        }

        if self.shared.options.dry_run {
            let remaining = self.shared.uploads_queue.size().await;
            if remaining > 0 {
                let has_build_create = self.shared.uploads_queue.has("build/create").await;
                let count = remaining.saturating_sub(if has_build_create { 1 } else { 0 });
                self.shared.logger.info(format!("Found {count} snapshots"));
            }
        }

        if let Some(server) = &self.server {
            let _ = server.close().await;
        }
        if let Some(browser) = &self.browser {
            let _ = browser.close().await;
        }
        if let Some(static_server) = &self.static_server {
            let _ = static_server.close().await;
        }

        let build = self.shared.build.lock().unwrap().clone();
        if build.failed {
            match build.number {
                Some(number) => self.shared.logger.warn(format!("Build #{number} failed")),
                None => self.shared.logger.warn("Build failed".to_string()),
            }
        } else if let Some(id) = build.id.clone() {
            if let Err(err) = self.shared.client.finalize_build(&id).await {
                self.shared.logger.error(format!("Failed to finalize build: {err}"));
            }
        }

        self.set_ready_state(Some(ReadyState::Stopped));
        Ok(())
    }

    /// Closes both queues with abort; leaves everything else untouched.
    pub async fn close(&self) {
        self.shared.snapshots_queue.close(true).await;
        self.shared.uploads_queue.close(true).await;
    }
}

/// Schedule an `upload/<name>` task for `payload` (spec.md §4.4's
/// `_scheduleUpload`). Rejects immediately if the build is already
/// poisoned. Free-standing (rather than a `Percy` method) so it can be
/// called both from [`Percy::take_snapshot`]'s `on_done` drain and, via the
/// same `Shared` handle, from inside a queued task closure.
async fn schedule_upload_on(shared: &Shared, payload: SnapshotPayload) -> Result<(), PercyError> {
    if let Some(error) = shared.build.lock().unwrap().error.clone() {
        return Err(PercyError::Build(error));
    }

    let name = payload.name.clone();
    let task_shared = shared.clone();
    let handle = shared
        .uploads_queue
        .push(format!("upload/{name}"), Priority::NONE, move || {
            let shared = task_shared;
            async move {
                let build_id = shared.build.lock().unwrap().id.clone();
                let Some(build_id) = build_id else {
                    return Err(TaskError::Failed("upload attempted before build was created".to_string()));
                };
                match shared.client.send_snapshot(&build_id, payload).await {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        if let Some(detail) = err.build_poisoning_detail() {
                            {
                                let mut build = shared.build.lock().unwrap();
                                build.failed = true;
                                build.error = Some(detail.to_string());
                            }
                            shared.logger.error(format!("build poisoned: {detail}"));
                            shared.uploads_queue.close(true).await;
                            shared.snapshots_queue.close(true).await;
                        }
                        Err(TaskError::Failed(err.to_string()))
                    }
                }
            }
        })
        .await;

    if let Some(handle) = handle {
        let logger = shared.logger.clone();
        tokio::spawn(async move {
            if let Err(err) = handle.await {
                if !matches!(err, QueueError::Task(TaskError::Canceled)) {
                    logger.error(format!("upload {name} failed: {err}"));
                }
            }
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ApiErrorDetail, BuildInfo, UploadError};
    use async_trait::async_trait;
    use percy_logger::{LogLevel, LoggerGroup, NamespaceFilter};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeClient {
        builds: AtomicU64,
        finalize_calls: AtomicUsize,
        next_upload_error: AsyncMutex<Option<UploadError>>,
        sent: AsyncMutex<Vec<String>>,
    }

    impl FakeClient {
        fn new() -> Self {
            Self {
                builds: AtomicU64::new(0),
                finalize_calls: AtomicUsize::new(0),
                next_upload_error: AsyncMutex::new(None),
                sent: AsyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RemoteClient for FakeClient {
        async fn create_build(&self) -> anyhow::Result<BuildInfo> {
            let number = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(BuildInfo {
                id: format!("build-{number}"),
                number,
                url: format!("https://percy.example/builds/{number}"),
            })
        }

        async fn finalize_build(&self, _build_id: &str) -> anyhow::Result<()> {
            self.finalize_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send_snapshot(&self, _build_id: &str, payload: SnapshotPayload) -> Result<(), UploadError> {
            if let Some(err) = self.next_upload_error.lock().await.take() {
                return Err(err);
            }
            self.sent.lock().await.push(payload.name);
            Ok(())
        }

        async fn add_client_info(&self, _info: String) {}
        async fn add_environment_info(&self, _info: String) {}
    }

    struct FakeGatherer;

    #[async_trait]
    impl SnapshotGatherer for FakeGatherer {
        async fn gather_snapshots(&self, _ctx: &PercyContext, options: SnapshotOptions) -> anyhow::Result<Vec<Snapshot>> {
            let name = options.url.or(options.name).unwrap_or_else(|| "snapshot".to_string());
            Ok(vec![Snapshot {
                name,
                meta: serde_json::Value::Null,
                additional_snapshots: Vec::new(),
            }])
        }
    }

    struct FakeDiscoverer;

    #[async_trait]
    impl ResourceDiscoverer for FakeDiscoverer {
        async fn discover_snapshot_resources(
            &self,
            _ctx: &PercyContext,
            snapshot: &Snapshot,
            on_done: &OnSnapshotDone,
        ) -> anyhow::Result<()> {
            on_done(SnapshotPayload {
                name: snapshot.name.clone(),
                data: serde_json::Value::Null,
            });
            Ok(())
        }
    }

    struct FakeStaticServer {
        calls: AsyncMutex<Vec<std::path::PathBuf>>,
        closed: AtomicUsize,
    }

    impl FakeStaticServer {
        fn new() -> Self {
            Self {
                calls: AsyncMutex::new(Vec::new()),
                closed: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StaticFileServer for FakeStaticServer {
        async fn serve(&self, path: &std::path::Path) -> anyhow::Result<String> {
            self.calls.lock().await.push(path.to_path_buf());
            Ok(format!("http://127.0.0.1:9/{}", path.display()))
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Records whatever `base_url` it was handed, so tests can assert the
    /// static server's address actually reached the gatherer.
    struct BaseUrlCapturingGatherer {
        captured: Arc<AsyncMutex<Option<String>>>,
    }

    #[async_trait]
    impl SnapshotGatherer for BaseUrlCapturingGatherer {
        async fn gather_snapshots(&self, _ctx: &PercyContext, options: SnapshotOptions) -> anyhow::Result<Vec<Snapshot>> {
            *self.captured.lock().await = options.base_url.clone();
            Ok(vec![Snapshot {
                name: options.url.unwrap_or_else(|| "served".to_string()),
                meta: serde_json::Value::Null,
                additional_snapshots: Vec::new(),
            }])
        }
    }

    struct PassthroughValidator;

    impl OptionsValidator for PassthroughValidator {
        fn validate_snapshot_options(&self, options: SnapshotOptions) -> anyhow::Result<SnapshotOptions> {
            Ok(options)
        }
    }

    fn test_logger() -> Logger {
        let group = LoggerGroup::with_filter(NamespaceFilter::all(), LogLevel::Debug);
        group.set_quiet(true);
        group.logger("percy:core")
    }

    fn test_percy(options: Options, client: Arc<FakeClient>) -> Percy {
        Percy::new(
            options,
            test_logger(),
            client,
            Arc::new(FakeGatherer),
            Arc::new(FakeDiscoverer),
            Arc::new(PassthroughValidator),
            None,
            None,
            None,
        )
    }

    #[tokio::test]
    async fn start_then_stop_finalizes_the_build() {
        let client = Arc::new(FakeClient::new());
        let percy = test_percy(Options::default(), client.clone());
        let token = CancellationToken::new();

        percy.start(&token).await.unwrap();
        assert_eq!(percy.ready_state(), Some(ReadyState::Running));
        assert_eq!(percy.build().number, Some(1));

        percy.stop(false, &token).await.unwrap();
        assert_eq!(percy.ready_state(), Some(ReadyState::Stopped));
        assert_eq!(client.finalize_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn snapshot_before_start_is_rejected() {
        let client = Arc::new(FakeClient::new());
        let percy = test_percy(Options::default(), client);
        let token = CancellationToken::new();

        let err = percy.snapshot("https://example.com", &token).await.unwrap_err();
        assert!(!err.is_canceled());
    }

    #[tokio::test]
    async fn snapshot_discovers_and_uploads() {
        let client = Arc::new(FakeClient::new());
        let percy = test_percy(Options::default(), client.clone());
        let token = CancellationToken::new();

        percy.start(&token).await.unwrap();
        percy.snapshot("https://example.com/page", &token).await.unwrap();
        percy.stop(false, &token).await.unwrap();

        assert_eq!(client.sent.lock().await.as_slice(), ["https://example.com/page"]);
    }

    #[tokio::test]
    async fn build_poisoning_rejects_further_snapshots_and_skips_finalize() {
        let client = Arc::new(FakeClient::new());
        {
            *client.next_upload_error.lock().await = Some(UploadError::Http {
                status: 422,
                errors: vec![ApiErrorDetail {
                    pointer: Some("/data/attributes/build".to_string()),
                    detail: "build failed".to_string(),
                }],
            });
        }
        let percy = test_percy(Options::default(), client.clone());
        let token = CancellationToken::new();

        percy.start(&token).await.unwrap();
        percy.snapshot("https://example.com/page", &token).await.unwrap();

        // Give the spawned upload task a moment to observe the 422 and
        // poison the build.
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(percy.build().failed);

        let err = percy.snapshot("https://example.com/other", &token).await.unwrap_err();
        assert!(matches!(err, PercyError::Build(_)));

        percy.stop(false, &token).await.unwrap();
        assert_eq!(client.finalize_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dry_run_counts_snapshots_without_uploading() {
        let client = Arc::new(FakeClient::new());
        let options = Options {
            dry_run: true,
            ..Options::default()
        };
        let percy = test_percy(options, client.clone());
        let token = CancellationToken::new();

        percy.start(&token).await.unwrap();
        for name in ["a", "b", "c"] {
            percy
                .snapshot(format!("https://example.com/{name}"), &token)
                .await
                .unwrap();
        }
        percy.stop(false, &token).await.unwrap();

        assert!(client.sent.lock().await.is_empty());
        let found = percy
            .logger()
            .group()
            .history()
            .into_iter()
            .filter(|entry| entry.message == "Found 3 snapshots")
            .count();
        assert_eq!(found, 1);
    }

    #[tokio::test]
    async fn snapshot_serve_path_starts_a_static_server_and_derives_base_url() {
        let client = Arc::new(FakeClient::new());
        let static_server = Arc::new(FakeStaticServer::new());
        let captured = Arc::new(AsyncMutex::new(None));

        let percy = Percy::new(
            Options::default(),
            test_logger(),
            client,
            Arc::new(BaseUrlCapturingGatherer { captured: captured.clone() }),
            Arc::new(FakeDiscoverer),
            Arc::new(PassthroughValidator),
            None,
            None,
            Some(static_server.clone()),
        );
        let token = CancellationToken::new();
        percy.start(&token).await.unwrap();

        percy
            .snapshot(
                SnapshotOptions {
                    url: Some("https://example.com".to_string()),
                    serve: Some(std::path::PathBuf::from("./dist")),
                    ..Default::default()
                },
                &token,
            )
            .await
            .unwrap();

        assert_eq!(
            *captured.lock().await,
            Some("http://127.0.0.1:9/./dist".to_string())
        );
        assert_eq!(static_server.calls.lock().await.len(), 1);

        percy.stop(false, &token).await.unwrap();
        assert_eq!(static_server.closed.load(Ordering::SeqCst), 1);
    }
}
