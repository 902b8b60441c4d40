use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use newsarc_core::ArchiveStore;
use newsarc_nntp::{ArticleSource, Fetcher, NntpSession, RetryPolicy, StatusSink};

mod cli;
mod config;
mod status;
mod sync;

use crate::cli::Cli;
use crate::status::ConsoleStatus;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = config::load_config();

    if args.list_groups {
        let mut session = NntpSession::connect(&config.server.host, config.server.port).await?;
        for group in session.list().await? {
            println!("{}", group.name);
        }
        let _ = session.quit().await;
        return Ok(());
    }

    let store = ArchiveStore::connect(&config.database.path).await?;
    store.init().await?;

    sync::resolve_pass(&store).await?;
    if args.update_references {
        return Ok(());
    }

    if !args.groups.is_empty() {
        let options = sync::SyncOptions {
            aggressive: args.aggressive,
            dry_run: args.dry_run,
            keep_going: args.keep_going,
            update: args.update,
            start: args.start,
            count: args.number,
        };
        let policy = RetryPolicy {
            aggressive: args.aggressive,
            ..RetryPolicy::default()
        };
        let sink: Arc<dyn StatusSink> = Arc::new(ConsoleStatus::new(args.quiet));
        let session = NntpSession::connect(&config.server.host, config.server.port).await?;
        let fetcher = Fetcher::new(session, policy, sink.clone());
        sync::run_sync(&store, fetcher, &args.groups, options, sink.as_ref()).await?;
    }

    sync::resolve_pass(&store).await?;
    Ok(())
}
