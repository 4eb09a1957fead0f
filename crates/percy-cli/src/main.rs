//! A thin binary demonstrating how the three library crates fit together.
//! The collaborator traits `percy-core` leaves abstract (a real browser
//! driver, a real Percy backend client) are wired here to the in-memory
//! stand-ins in [`stubs`] — this binary does not ship a headless browser or
//! talk to any actual HTTP API.

mod cli;
mod stubs;

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use percy_core::{Options, Percy, ServerHandle};
use percy_logger::LoggerGroup;

use crate::cli::Cli;
use crate::stubs::{
    InMemoryClient, NullBrowser, NullDiscoverer, NullServer, NullStaticServer, PassthroughGatherer,
    PassthroughValidator,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let group = LoggerGroup::from_env();
    group.set_quiet(cli.quiet);
    let logger = group.logger("percy:cli");

    let mut options = Options {
        loglevel: cli.loglevel.clone(),
        defer_uploads: cli.defer_uploads,
        skip_uploads: cli.skip_uploads,
        dry_run: cli.dry_run,
        token: cli.token.clone(),
        port: cli.port,
        server: Some(!cli.no_server),
        concurrency: cli.concurrency,
        ..Options::default()
    };
    options.normalize();

    let server: Option<Arc<dyn ServerHandle>> =
        if options.server == Some(false) { None } else { Some(Arc::new(NullServer)) };

    let percy = Percy::new(
        options,
        logger.clone(),
        Arc::new(InMemoryClient::new()),
        Arc::new(PassthroughGatherer),
        Arc::new(NullDiscoverer),
        Arc::new(PassthroughValidator),
        Some(Arc::new(NullBrowser)),
        server,
        Some(Arc::new(NullStaticServer)),
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    percy.start(&cancel).await?;

    for url in &cli.urls {
        if let Err(err) = percy.snapshot(url.as_str(), &cancel).await {
            logger.error(format!("snapshot {url} failed: {err}"));
        }
    }

    percy.stop(false, &cancel).await?;
    Ok(())
}
