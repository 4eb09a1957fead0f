//! In-memory stand-ins for the seven collaborator traits `percy-core` leaves
//! abstract. None of these talk to a real browser or a real Percy backend —
//! they exist so this binary can demonstrate the queue/build/log wiring end
//! to end without an external dependency on a browser SDK or HTTP service.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use percy_core::{
    BrowserDriver, BuildInfo, OptionsValidator, PercyContext, RemoteClient, ResourceDiscoverer,
    ServerHandle, Snapshot, SnapshotGatherer, SnapshotOptions, SnapshotPayload, StaticFileServer,
    UploadError,
};

/// Hands out sequential build numbers and logs every call instead of
/// actually talking to a Percy-shaped HTTP API.
pub struct InMemoryClient {
    next_number: AtomicU64,
}

impl InMemoryClient {
    pub fn new() -> Self {
        Self { next_number: AtomicU64::new(1) }
    }
}

#[async_trait]
impl RemoteClient for InMemoryClient {
    async fn create_build(&self) -> anyhow::Result<BuildInfo> {
        let number = self.next_number.fetch_add(1, Ordering::SeqCst);
        Ok(BuildInfo {
            id: format!("local-build-{number}"),
            number,
            url: format!("https://percy.example/builds/local-build-{number}"),
        })
    }

    async fn finalize_build(&self, _build_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_snapshot(&self, _build_id: &str, _payload: SnapshotPayload) -> Result<(), UploadError> {
        Ok(())
    }

    async fn add_client_info(&self, _info: String) {}
    async fn add_environment_info(&self, _info: String) {}
}

/// Never actually launches anything; just tracks whether `launch` ran.
pub struct NullBrowser;

#[async_trait]
impl BrowserDriver for NullBrowser {
    async fn launch(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        false
    }
}

/// Accepts a `listen` call without binding a socket.
pub struct NullServer;

#[async_trait]
impl ServerHandle for NullServer {
    async fn listen(&self, _port: u16) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn address(&self) -> Option<SocketAddr> {
        None
    }
}

/// Reports every `serve` path back as a `file://` URL instead of actually
/// binding a static file server.
pub struct NullStaticServer;

#[async_trait]
impl StaticFileServer for NullStaticServer {
    async fn serve(&self, path: &Path) -> anyhow::Result<String> {
        Ok(format!("file://{}", path.display()))
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Turns one [`SnapshotOptions`] into exactly one [`Snapshot`] named after
/// its URL, sitemap, or explicit `name` — no sitemap crawling, no recursive
/// expansion.
pub struct PassthroughGatherer;

#[async_trait]
impl SnapshotGatherer for PassthroughGatherer {
    async fn gather_snapshots(&self, _ctx: &PercyContext, options: SnapshotOptions) -> anyhow::Result<Vec<Snapshot>> {
        let name = options
            .name
            .clone()
            .or_else(|| options.url.clone())
            .or_else(|| options.sitemap.clone())
            .ok_or_else(|| anyhow::anyhow!("snapshot options need a name, url, or sitemap"))?;

        Ok(vec![Snapshot {
            name,
            meta: serde_json::json!({ "url": options.url, "sitemap": options.sitemap }),
            additional_snapshots: Vec::new(),
        }])
    }
}

/// Completes discovery immediately with a single empty-payload upload —
/// stands in for a real headless-browser resource crawl.
pub struct NullDiscoverer;

#[async_trait]
impl ResourceDiscoverer for NullDiscoverer {
    async fn discover_snapshot_resources(
        &self,
        _ctx: &PercyContext,
        snapshot: &Snapshot,
        on_done: &percy_core::OnSnapshotDone,
    ) -> anyhow::Result<()> {
        on_done(SnapshotPayload { name: snapshot.name.clone(), data: snapshot.meta.clone() });
        Ok(())
    }
}

/// Accepts every snapshot request unmodified.
pub struct PassthroughValidator;

impl OptionsValidator for PassthroughValidator {
    fn validate_snapshot_options(&self, options: SnapshotOptions) -> anyhow::Result<SnapshotOptions> {
        Ok(options)
    }
}
