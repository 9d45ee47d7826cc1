use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tgcloud_scanner::client::HttpRemoteClient;
use tgcloud_scanner::config;
use tgcloud_scanner::db;
use tgcloud_scanner::missions::{self, SyncOptions};
use tgcloud_scanner::settings;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Fetch remote missions and their accounts into the local store, then exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Missions requested from the listing endpoint
    #[arg(long, default_value = "10")]
    mission_limit: u32,

    /// Page size for mission account listings
    #[arg(long, default_value = "10")]
    account_limit: u32,

    /// Pause between account pages, in milliseconds
    #[arg(long, default_value = "0")]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    settings::seed_defaults(&pool).await?;

    let credentials = settings::load_credentials(&pool).await?;
    if !credentials.is_complete() {
        bail!("Auth.cookie and Auth.token must be set before syncing missions");
    }
    let client = HttpRemoteClient::new(&cfg.remote, &credentials)?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("stop requested");
            ctrl_c.cancel();
        }
    });

    let options = SyncOptions {
        mission_limit: args.mission_limit,
        account_limit: args.account_limit,
        interval: Duration::from_millis(args.interval_ms),
    };
    let report = missions::sync_missions(&pool, &client, &cancel, &options).await?;
    info!(
        missions = report.missions,
        accounts = report.accounts,
        failed_pages = report.failed_pages,
        cancelled = report.cancelled,
        "done"
    );
    Ok(())
}
