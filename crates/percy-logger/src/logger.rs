use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tokio::sync::broadcast;

use crate::entry::LogEntry;
use crate::filter::{LogLevel, NamespaceFilter};
use crate::progress::ProgressLine;

/// Shared state behind every [`Logger`] handle cloned out of the same
/// [`LoggerGroup`] — namespace filter, retained history, the remote
/// broadcast fan-out, and the single progress line all live here, mirroring
/// the teacher's pattern of one inner actor/state struct behind a cheap
/// handle (see `client-engine::engine::EngineInner`).
struct Inner {
    filter: RwLock<NamespaceFilter>,
    level_floor: RwLock<LogLevel>,
    quiet: std::sync::atomic::AtomicBool,
    /// Set while this group is forwarding itself to a remote sink via
    /// [`crate::remote::connect`] (spec.md §4.3's `remote()`, the client
    /// side). While set, every `log()` call is forwarded over the socket
    /// unconditionally (bypassing `shouldLog`) and local stdio is silent —
    /// spec.md L3.
    is_remote: std::sync::atomic::AtomicBool,
    memory: Mutex<Vec<LogEntry>>,
    remote_tx: broadcast::Sender<LogEntry>,
    progress: Mutex<ProgressLine>,
    deprecation_seen: Mutex<HashSet<String>>,
    /// The latest `{"env":{...}}` update received over a remote connection
    /// (spec.md §6: "Client→server env update at any time ... merged into
    /// the process env view"). `None` until one arrives.
    remote_env: Mutex<Option<RemoteEnv>>,
}

/// An environment snapshot/update received from a remote peer (spec.md §6's
/// `{"env":{"PERCY_DEBUG":…,"PERCY_LOGLEVEL":…}}`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteEnv {
    pub percy_debug: Option<String>,
    pub percy_loglevel: Option<String>,
}

/// Owns the shared logging state for a process: the namespace filter, the
/// in-memory retention buffer, and the remote fan-out channel. Individual
/// [`Logger`]s are cheap namespaced views over one group.
#[derive(Clone)]
pub struct LoggerGroup {
    inner: Arc<Inner>,
}

impl LoggerGroup {
    /// Build a group from an explicit filter spec and level floor, bypassing
    /// environment variables entirely (used by tests and by callers that
    /// manage their own configuration).
    pub fn with_filter(filter: NamespaceFilter, level_floor: LogLevel) -> Self {
        let (remote_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                filter: RwLock::new(filter),
                level_floor: RwLock::new(level_floor),
                quiet: std::sync::atomic::AtomicBool::new(false),
                is_remote: std::sync::atomic::AtomicBool::new(false),
                memory: Mutex::new(Vec::new()),
                remote_tx,
                progress: Mutex::new(ProgressLine::new()),
                deprecation_seen: Mutex::new(HashSet::new()),
                remote_env: Mutex::new(None),
            }),
        }
    }

    /// Build a group from `PERCY_DEBUG` (namespace filter spec, default
    /// unset/none) and `PERCY_LOGLEVEL` (level floor, default `info`).
    pub fn from_env() -> Self {
        let filter = match std::env::var("PERCY_DEBUG") {
            Ok(spec) if !spec.trim().is_empty() => NamespaceFilter::parse(&spec),
            _ => NamespaceFilter::none(),
        };
        let level_floor = std::env::var("PERCY_LOGLEVEL")
            .map(|raw| LogLevel::parse(&raw))
            .unwrap_or(LogLevel::Info);
        Self::with_filter(filter, level_floor)
    }

    /// A namespaced view over this group's shared state.
    pub fn logger(&self, namespace: impl Into<String>) -> Logger {
        Logger {
            namespace: namespace.into(),
            group: self.clone(),
        }
    }

    /// Suppress stdout/progress output entirely, without affecting
    /// retention or remote forwarding. Used by callers (e.g. `percy-cli`'s
    /// `--quiet`) that still want programmatic access to the log.
    pub fn set_quiet(&self, quiet: bool) {
        self.inner.quiet.store(quiet, std::sync::atomic::Ordering::Relaxed);
    }

    /// Replace the namespace filter at runtime (e.g. in response to a
    /// config reload).
    pub fn set_filter(&self, filter: NamespaceFilter) {
        *self.inner.filter.write().unwrap() = filter;
    }

    /// Every entry retained so far, oldest first.
    pub fn history(&self) -> Vec<LogEntry> {
        self.inner.memory.lock().unwrap().clone()
    }

    /// Subscribe to new entries as they're produced, for remote forwarding.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.inner.remote_tx.subscribe()
    }

    /// Mark this group as currently forwarding itself to a remote sink (or
    /// clear that mark once the connection drops). See [`Inner::is_remote`].
    pub(crate) fn set_remote(&self, remote: bool) {
        self.inner.is_remote.store(remote, std::sync::atomic::Ordering::Relaxed);
    }

    fn is_remote(&self) -> bool {
        self.inner.is_remote.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Record `entry` received from a remote peer into the local store
    /// (spec.md §4.3's `connect(socket)`: "treat incoming messages as
    /// `{log:[...]}` or `{logAll:[entries]}` and merge into the local
    /// store"). Unlike [`LoggerGroup::record`], this never re-broadcasts:
    /// the entry already came from the wire, so echoing it back out would
    /// loop.
    pub(crate) fn merge_remote_entry(&self, entry: LogEntry) {
        self.inner.memory.lock().unwrap().push(entry);
    }

    /// Merge an entire `{"logAll":[...]}` backlog, in order.
    pub(crate) fn merge_remote_entries(&self, entries: Vec<LogEntry>) {
        self.inner.memory.lock().unwrap().extend(entries);
    }

    /// Merge a `{"env":{...}}` update received from a remote peer into the
    /// tracked view (spec.md §6).
    pub(crate) fn merge_env(&self, env: RemoteEnv) {
        *self.inner.remote_env.lock().unwrap() = Some(env);
    }

    /// The latest remote environment snapshot/update received, if any.
    pub fn remote_env(&self) -> Option<RemoteEnv> {
        self.inner.remote_env.lock().unwrap().clone()
    }

    /// Retain `entry` in the in-memory store and, depending on mode, either
    /// forward it remotely or print it locally.
    ///
    /// Per spec.md L1, retention is unconditional *when not remote*: once
    /// [`LoggerGroup::set_remote`] is active, this group's own entries
    /// belong to whatever sink it's forwarding to, not to this process's
    /// local store, so they're forwarded over the socket (bypassing
    /// `shouldLog` entirely — spec.md L3) instead of being retained here.
    /// Otherwise `shouldLog` gates the local stdout/stderr write, but
    /// retention still happens regardless of that gate.
    fn record(&self, namespace: &str, level: LogLevel, message: String) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            namespace: namespace.to_string(),
            level,
            message,
            meta: serde_json::Map::new(),
        };

        if self.is_remote() {
            let _ = self.inner.remote_tx.send(entry);
            return;
        }

        self.inner.memory.lock().unwrap().push(entry.clone());

        if !self.should_log(namespace, level) {
            return;
        }

        if !self.inner.quiet.load(std::sync::atomic::Ordering::Relaxed) {
            let mut progress = self.inner.progress.lock().unwrap();
            progress.clear();
            println!("{}", format_line(&entry));
            progress.restore();
        }
    }

    fn should_log(&self, namespace: &str, level: LogLevel) -> bool {
        if level < *self.inner.level_floor.read().unwrap() {
            return false;
        }
        match level {
            LogLevel::Warn | LogLevel::Error => true,
            _ => self.inner.filter.read().unwrap().matches(namespace),
        }
    }
}

/// Format an entry the way it's printed to stdout: `[namespace] message`,
/// with the level folded into the namespace bracket for anything above
/// `info`.
fn format_line(entry: &LogEntry) -> String {
    match entry.level {
        LogLevel::Warn => format!("[{} :: warn] {}", entry.namespace, entry.message),
        LogLevel::Error => format!("[{} :: error] {}", entry.namespace, entry.message),
        _ => format!("[{}] {}", entry.namespace, entry.message),
    }
}

/// A namespaced logging handle. Cheap to clone; every clone shares the same
/// [`LoggerGroup`] state.
#[derive(Clone)]
pub struct Logger {
    namespace: String,
    group: LoggerGroup,
}

impl Logger {
    /// This logger's namespace, e.g. `percy:core`.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// A child logger under `self.namespace():child`.
    pub fn child(&self, child: &str) -> Logger {
        self.group.logger(format!("{}:{child}", self.namespace))
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message.into());
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message.into());
    }

    /// Like [`Logger::warn`], but emits a given exact message at most once
    /// per logger lifetime (spec.md L2), so a repeatedly-hit deprecated path
    /// doesn't flood the log. Grounded in the teacher's retry-error dedupe
    /// (`last_compute_err` in `client-engine::worker`), adapted from a
    /// time-windowed dedupe to a lifetime one to match L2 exactly.
    pub fn deprecated(&self, message: impl Into<String>) {
        let message = message.into();
        let mut seen = self.group.inner.deprecation_seen.lock().unwrap();
        if seen.insert(message.clone()) {
            drop(seen);
            self.log(LogLevel::Warn, format!("deprecated: {message}"));
        }
    }

    /// Whether a call at `level` would actually produce output right now.
    pub fn should_log(&self, level: LogLevel) -> bool {
        self.group.should_log(&self.namespace, level)
    }

    /// Render `text` as the current single-line progress indicator.
    ///
    /// On a TTY, each call rewrites the same line in place. Off a TTY
    /// (piped output, CI logs — spec.md §4.3), only the first call prints;
    /// later calls are silently suppressed until an interleaved plain log
    /// line resets that, so polling callbacks (e.g. `Percy::flush`'s
    /// once-per-tick progress) don't spam one line per poll. `persist`
    /// marks this progress line to survive such an interleaved write
    /// instead of staying erased.
    pub fn progress(&self, text: impl AsRef<str>, persist: bool) {
        if self.group.inner.quiet.load(std::sync::atomic::Ordering::Relaxed) {
            return;
        }
        self.group.inner.progress.lock().unwrap().render(text.as_ref(), persist);
    }

    /// Finish a progress line that was being redrawn, moving the cursor to
    /// a fresh line so subsequent output doesn't overwrite it.
    pub fn progress_done(&self) {
        self.group.inner.progress.lock().unwrap().finish();
    }

    /// `[namespace] message`, the same shape printed to stdout — exposed so
    /// callers (and tests) can compare against retained/forwarded entries.
    pub fn format(&self, level: LogLevel, message: &str) -> String {
        format_line(&LogEntry {
            timestamp: Utc::now(),
            namespace: self.namespace.clone(),
            level,
            message: message.to_string(),
            meta: serde_json::Map::new(),
        })
    }

    /// Access to the shared group, e.g. to wire up remote forwarding.
    pub fn group(&self) -> &LoggerGroup {
        &self.group
    }

    fn log(&self, level: LogLevel, message: String) {
        self.group.record(&self.namespace, level, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_is_silenced_without_a_matching_filter() {
        let group = LoggerGroup::with_filter(NamespaceFilter::none(), LogLevel::Info);
        let logger = group.logger("percy:core");
        assert!(!logger.should_log(LogLevel::Debug));
        assert!(logger.should_log(LogLevel::Warn));
        assert!(logger.should_log(LogLevel::Error));
    }

    #[test]
    fn debug_is_enabled_once_the_namespace_matches() {
        let group = LoggerGroup::with_filter(NamespaceFilter::parse("percy:*"), LogLevel::Info);
        let logger = group.logger("percy:core");
        assert!(logger.should_log(LogLevel::Debug));
    }

    #[test]
    fn level_floor_of_warn_suppresses_info() {
        let group = LoggerGroup::with_filter(NamespaceFilter::all(), LogLevel::Warn);
        let logger = group.logger("percy:core");
        assert!(!logger.should_log(LogLevel::Info));
        assert!(logger.should_log(LogLevel::Warn));
    }

    #[test]
    fn retained_history_records_logged_lines() {
        let group = LoggerGroup::with_filter(NamespaceFilter::all(), LogLevel::Debug);
        group.set_quiet(true);
        let logger = group.logger("percy:core");
        logger.info("starting build");
        let history = group.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "starting build");
    }

    #[test]
    fn filtered_out_lines_are_still_retained_in_memory() {
        // spec.md L1: a namespace that doesn't match `include` (or matches
        // `exclude`) never reaches stdout, but `query`/`history` still sees it.
        let group = LoggerGroup::with_filter(NamespaceFilter::none(), LogLevel::Debug);
        let logger = group.logger("percy:core");
        assert!(!logger.should_log(LogLevel::Debug));

        logger.debug("this never hits a terminal");
        let history = group.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "this never hits a terminal");
    }

    #[test]
    fn deprecated_only_emits_once_within_the_window() {
        let group = LoggerGroup::with_filter(NamespaceFilter::all(), LogLevel::Debug);
        group.set_quiet(true);
        let logger = group.logger("percy:core");
        logger.deprecated("old flag");
        logger.deprecated("old flag");
        let history = group.history();
        assert_eq!(history.len(), 1);
    }
}
