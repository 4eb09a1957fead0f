//! Command-line surface, wired directly onto [`percy_core::Options`].

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "percy", version, about = "Visual regression snapshot orchestrator")]
pub struct Cli {
    /// URLs (or `.xml` sitemaps) to snapshot, taken one at a time after start.
    pub urls: Vec<String>,

    #[arg(long, env = "PERCY_TOKEN")]
    pub token: Option<String>,

    /// Gather and count snapshots without launching a browser, discovering
    /// resources, or uploading anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Discover and gather normally, but never upload.
    #[arg(long)]
    pub skip_uploads: bool,

    /// Don't start the uploads queue until `flush`/`stop`.
    #[arg(long)]
    pub defer_uploads: bool,

    #[arg(long, default_value_t = 5338)]
    pub port: u16,

    /// Don't bind the local server even though a handle is available.
    #[arg(long)]
    pub no_server: bool,

    #[arg(long)]
    pub concurrency: Option<usize>,

    #[arg(long, env = "PERCY_LOGLEVEL")]
    pub loglevel: Option<String>,

    #[arg(long)]
    pub quiet: bool,
}
