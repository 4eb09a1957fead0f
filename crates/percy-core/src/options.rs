//! Construction options and the two pieces of mutable top-level state
//! (spec.md §3, §4.4): the build record and the ready-state machine.

/// Percy's construction options (spec.md §4.4). Every field is optional in
/// spirit; [`Options::default`] matches the source's defaults, and
/// [`Options::normalize`] applies the `dryRun ⇒ skipUploads ⇒ deferUploads`
/// implication chain the same way `EngineConfig`'s zero-means-default
/// normalization is applied in `run_engine` on the teacher side.
#[derive(Debug, Clone)]
pub struct Options {
    pub loglevel: Option<String>,
    /// Don't run the uploads queue until `flush`/`stop` explicitly does.
    pub defer_uploads: bool,
    /// Never upload; implies `defer_uploads`.
    pub skip_uploads: bool,
    /// Skip browser launch entirely; implies `skip_uploads`.
    pub dry_run: bool,
    /// Path to an external config file. Loading it is out of scope for this
    /// crate (spec.md §1); carried here only so a caller's loader can stash
    /// the path it read from for diagnostics.
    pub config: Option<std::path::PathBuf>,
    pub token: Option<String>,
    pub client_info: Option<String>,
    pub environment_info: Option<String>,
    /// Whether to start the local server. `None` means "use the
    /// `ServerHandle`, if one was supplied"; `Some(false)` forces it off
    /// even if a handle was supplied.
    pub server: Option<bool>,
    pub port: u16,
    /// `Some(false)` skips browser launch regardless of `dry_run` (spec.md:
    /// "if not dry-run and `options.browser ≠ false`").
    pub browser: Option<bool>,
    /// Concurrency for both queues. `None` defaults to 10 (spec.md §4.4:
    /// "concurrency = `discovery.concurrency` if set, else 10").
    pub concurrency: Option<usize>,
    /// Everything else — normalized as `snapshot`/`discovery` config by an
    /// external `PercyConfig` loader this crate doesn't implement.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            loglevel: None,
            defer_uploads: false,
            skip_uploads: false,
            dry_run: false,
            config: None,
            token: None,
            client_info: None,
            environment_info: None,
            server: None,
            port: 5338,
            browser: None,
            concurrency: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl Options {
    /// Apply the implication chain from spec.md §4.4: `dry_run` implies
    /// `skip_uploads`, which implies `defer_uploads`. Idempotent; called
    /// once by [`crate::Percy::new`].
    pub fn normalize(&mut self) {
        if self.dry_run {
            self.skip_uploads = true;
        }
        if self.skip_uploads {
            self.defer_uploads = true;
        }
    }

    /// The concurrency both queues are constructed with.
    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or(10).max(1)
    }

    /// Whether `start()` should launch a browser.
    pub fn should_launch_browser(&self) -> bool {
        !self.dry_run && self.browser != Some(false)
    }
}

/// The server-side build record (spec.md §3). Exactly one exists per Percy
/// run; it transitions `absent → created → {healthy | error}` and, while
/// healthy, can later be poisoned by a rejected upload (`failed = true`).
#[derive(Debug, Clone, Default)]
pub struct BuildState {
    pub id: Option<String>,
    pub number: Option<u64>,
    pub url: Option<String>,
    pub error: Option<String>,
    pub failed: bool,
}

impl BuildState {
    /// True once `build/create` has poisoned the build, or failed outright.
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// `Percy::readyState` (spec.md §3): `None` means "not started". Transitions
/// are one-way except `Stopping → Running` (cancellation of `stop`) and
/// `Starting → absent` (cancellation of a deferred start) — both handled in
/// `percy::Percy::start`/`percy::Percy::stop` directly, since those are the
/// only two places a transition needs to go "backwards".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Starting,
    Running,
    Stopping,
    Stopped,
}
