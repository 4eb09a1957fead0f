//! External collaborators (spec.md §6), expressed as traits so `percy-core`
//! has zero knowledge of an actual headless browser, HTTP client, resource
//! discoverer, or local server. A real Percy distribution implements these
//! against `headless_chrome`/CDP, an HTTP SDK, etc.; `percy-cli` wires them
//! to small in-memory stand-ins for demonstration.

use std::sync::Arc;

use async_trait::async_trait;

use crate::options::{BuildState, Options};
use percy_logger::Logger;

/// A server-created build, returned by [`RemoteClient::create_build`].
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub id: String,
    pub number: u64,
    pub url: String,
}

/// One `source.pointer`/`detail` pair out of a JSON:API-shaped error body,
/// per spec.md §6: "errors may carry `response.statusCode` and
/// `response.body.errors[]` with `{source:{pointer}, detail}`".
#[derive(Debug, Clone)]
pub struct ApiErrorDetail {
    pub pointer: Option<String>,
    pub detail: String,
}

impl ApiErrorDetail {
    /// True for the specific pointer spec.md §4.4 calls out as poisoning the
    /// build: `/data/attributes/build`.
    pub fn points_at_build(&self) -> bool {
        self.pointer.as_deref() == Some("/data/attributes/build")
    }
}

/// Failure uploading a single snapshot (spec.md §7's `UploadError`).
#[derive(Debug, Clone, thiserror::Error)]
pub enum UploadError {
    /// An HTTP-shaped failure with a status code and (possibly empty)
    /// structured error list — the shape needed to detect the 422
    /// build-poisoning case.
    #[error("upload failed with status {status}")]
    Http {
        status: u16,
        errors: Vec<ApiErrorDetail>,
    },
    /// Any other transport/serialization failure.
    #[error("{0}")]
    Other(String),
}

impl UploadError {
    /// The build-poisoning detail, if this failure is a 422 pointing at
    /// `/data/attributes/build`.
    pub fn build_poisoning_detail(&self) -> Option<&str> {
        match self {
            UploadError::Http { status: 422, errors } => errors
                .iter()
                .find(|e| e.points_at_build())
                .map(|e| e.detail.as_str()),
            _ => None,
        }
    }
}

/// The remote API client (spec.md §6): build lifecycle and per-snapshot
/// upload.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn create_build(&self) -> anyhow::Result<BuildInfo>;
    async fn finalize_build(&self, build_id: &str) -> anyhow::Result<()>;
    async fn send_snapshot(&self, build_id: &str, payload: SnapshotPayload) -> Result<(), UploadError>;
    async fn add_client_info(&self, info: String);
    async fn add_environment_info(&self, info: String);
}

/// The headless browser driver (spec.md §6).
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
    fn is_connected(&self) -> bool;
}

/// The local HTTP/WebSocket server that exposes the core to a browser-side
/// discovery agent (spec.md §6). Out of scope beyond this interface.
#[async_trait]
pub trait ServerHandle: Send + Sync {
    async fn listen(&self, port: u16) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
    fn address(&self) -> Option<std::net::SocketAddr>;
}

/// Serves a local directory over HTTP for the lifetime of a `serve`d
/// snapshot request (spec.md §4.4 `snapshot()` step 1). Distinct from
/// [`ServerHandle`] — that one is Percy's single always-on control server
/// started once in `start()`; this one is started on demand, once per
/// distinct `options.serve` path, and may be asked to serve several paths
/// concurrently over the lifetime of one `Percy`. `Percy` closes every path
/// it started through this trait when it stops or closes.
#[async_trait]
pub trait StaticFileServer: Send + Sync {
    /// Start serving `path` (idempotent if already serving it) and return
    /// the base URL snapshot gathering should resolve relative asset URLs
    /// against.
    async fn serve(&self, path: &std::path::Path) -> anyhow::Result<String>;
    /// Tear down every path started through [`StaticFileServer::serve`].
    async fn close(&self) -> anyhow::Result<()>;
}

/// A snapshot request as normalized by [`OptionsValidator`] and passed to
/// [`SnapshotGatherer`]. Forms accepted by `Percy::snapshot` (a bare URL, a
/// `.xml` sitemap URL, a full options object, or an array of any of those)
/// all normalize down to this shape before gathering.
#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    pub name: Option<String>,
    pub url: Option<String>,
    pub sitemap: Option<String>,
    /// If present, `snapshot()` spins up a static server for this path
    /// before gathering (spec.md §4.4 step 1), via [`StaticFileServer`].
    pub serve: Option<std::path::PathBuf>,
    /// Derived from the static server's bound address once `serve` has been
    /// started (spec.md §4.4 step 1: "`baseUrl` is derived from its
    /// address"). `None` until [`crate::Percy::snapshot`] fills it in;
    /// `Percy` does not touch this field for a request without `serve`.
    pub base_url: Option<String>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One concrete snapshot produced by [`SnapshotGatherer::gather_snapshots`].
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub name: String,
    pub meta: serde_json::Value,
    /// Extra named sub-snapshots discovery may additionally produce under
    /// this one (spec.md §3's `additionalSnapshots`) — their
    /// `upload/<name>` tasks are canceled alongside the parent's when this
    /// snapshot is retaken.
    pub additional_snapshots: Vec<String>,
}

/// The payload [`ResourceDiscoverer`] hands back per completed sub-snapshot,
/// to be scheduled as an `upload/<name>` task.
#[derive(Debug, Clone)]
pub struct SnapshotPayload {
    pub name: String,
    pub data: serde_json::Value,
}

/// One of the forms `Percy::snapshot` accepts (spec.md §4.4): a bare URL, a
/// `.xml` sitemap URL, a fully-specified options object, or an array of any
/// of those (gathered and awaited in parallel).
#[derive(Debug, Clone)]
pub enum SnapshotInput {
    Url(String),
    Sitemap(String),
    Options(SnapshotOptions),
    Many(Vec<SnapshotInput>),
}

impl From<&str> for SnapshotInput {
    fn from(value: &str) -> Self {
        if value.ends_with(".xml") {
            SnapshotInput::Sitemap(value.to_string())
        } else {
            SnapshotInput::Url(value.to_string())
        }
    }
}

impl From<String> for SnapshotInput {
    fn from(value: String) -> Self {
        SnapshotInput::from(value.as_str())
    }
}

impl From<SnapshotOptions> for SnapshotInput {
    fn from(value: SnapshotOptions) -> Self {
        SnapshotInput::Options(value)
    }
}

impl<T: Into<SnapshotInput>> From<Vec<T>> for SnapshotInput {
    fn from(value: Vec<T>) -> Self {
        SnapshotInput::Many(value.into_iter().map(Into::into).collect())
    }
}

/// A read-only view over Percy's options/build/logger, passed to
/// [`SnapshotGatherer`] and [`ResourceDiscoverer`] instead of the full
/// `Percy` handle (spec.md §4.4's `gatherSnapshots(core, options)` and
/// `discoverSnapshotResources(core, snapshot, onDone)`) — this sidesteps a
/// `Percy`-depends-on-trait / trait-depends-on-`Percy` cycle while still
/// giving collaborators the context spec.md says they need.
#[derive(Clone)]
pub struct PercyContext {
    pub(crate) options: Arc<Options>,
    pub logger: Logger,
    pub(crate) build: std::sync::Arc<std::sync::Mutex<BuildState>>,
}

impl PercyContext {
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// A snapshot of the current build record.
    pub fn build(&self) -> BuildState {
        self.build.lock().unwrap().clone()
    }
}

/// Produces the list of concrete snapshots for one `snapshot()` call
/// (spec.md §6's `gatherSnapshots`).
#[async_trait]
pub trait SnapshotGatherer: Send + Sync {
    async fn gather_snapshots(
        &self,
        ctx: &PercyContext,
        options: SnapshotOptions,
    ) -> anyhow::Result<Vec<Snapshot>>;
}

/// Invoked once per completed sub-snapshot during discovery; the core
/// schedules an `upload/<name>` task for each payload it receives.
pub type OnSnapshotDone = Box<dyn Fn(SnapshotPayload) + Send + Sync>;

/// Drives headless-browser asset discovery for one snapshot (spec.md §6's
/// `discoverSnapshotResources`). `on_done` is called synchronously, once per
/// completed sub-snapshot (the primary snapshot and each of its
/// `additional_snapshots`), as discovery produces them — not batched at the
/// end — so uploads for early sub-snapshots can start before the rest of
/// discovery finishes.
#[async_trait]
pub trait ResourceDiscoverer: Send + Sync {
    async fn discover_snapshot_resources(
        &self,
        ctx: &PercyContext,
        snapshot: &Snapshot,
        on_done: &OnSnapshotDone,
    ) -> anyhow::Result<()>;
}

/// Normalizes and validates a snapshot request before gathering (spec.md
/// §6's `validateSnapshotOptions`). May reject the request outright; unlike
/// per-snapshot gather/discovery failures, a validation failure rejects the
/// whole `snapshot()` call (there's no snapshot list yet to fail
/// individually).
pub trait OptionsValidator: Send + Sync {
    fn validate_snapshot_options(&self, options: SnapshotOptions) -> anyhow::Result<SnapshotOptions>;
}
