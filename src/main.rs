use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use tgcloud_scanner::client::HttpConnector;
use tgcloud_scanner::config;
use tgcloud_scanner::db;
use tgcloud_scanner::engine::{Engine, ScanOptions, StartRequest};
use tgcloud_scanner::events::EngineOutputs;
use tgcloud_scanner::legacy;
use tgcloud_scanner::model::Credentials;
use tgcloud_scanner::settings;

#[derive(Debug, Parser)]
#[command(author, version, about = "Scan account ids downwards and record 2FA signals")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Highest id to scan (defaults to the stored General.start_id)
    #[arg(long)]
    top_id: Option<i64>,

    /// Number of concurrent workers (defaults to scan.workers)
    #[arg(long)]
    workers: Option<usize>,

    /// Pause between requests of one worker, in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Session cookie; stored for later runs when given
    #[arg(long)]
    cookie: Option<String>,

    /// API token; stored for later runs when given
    #[arg(long)]
    token: Option<String>,

    /// Legacy history file imported once on startup
    #[arg(long, default_value = legacy::HISTORY_FILE)]
    history: PathBuf,
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

    if let Some(report) = legacy::import_history(&pool, &args.history).await? {
        info!(accounts = report.accounts, codes = report.codes, "imported legacy history");
    }

    let stored = settings::load_credentials(&pool).await?;
    let credentials = Credentials::new(
        args.cookie.clone().unwrap_or(stored.cookie),
        args.token.clone().unwrap_or(stored.token),
    );
    if args.cookie.is_some() || args.token.is_some() {
        settings::save_credentials(&pool, &credentials).await?;
    }

    let top_id = match args.top_id {
        Some(id) => {
            settings::save_start_id(&pool, id).await?;
            id
        }
        None => match settings::start_id(&pool).await? {
            Some(id) => id,
            None => bail!("no --top-id given and no stored start id"),
        },
    };
    let interval = match args.interval_ms {
        Some(ms) => Duration::from_millis(ms),
        None => settings::effective_interval(&pool, cfg.scan.request_interval()).await?,
    };
    let workers = args.workers.unwrap_or(cfg.scan.workers);

    let connector = Arc::new(HttpConnector::new(cfg.remote.clone()));
    let (engine, outputs) =
        Engine::open(pool.clone(), connector, ScanOptions::from(&cfg.scan)).await?;
    let EngineOutputs {
        mut results,
        mut logs,
        mut progress,
    } = outputs;

    tokio::spawn(async move {
        while let Some(record) = results.recv().await {
            println!("{}\t{}", record.account_id, record.signal.display_text);
        }
    });
    tokio::spawn(async move {
        while let Some(progress) = progress.recv().await {
            info!(
                batch = progress.batch,
                state = ?progress.state,
                completed = progress.completed_workers,
                active = progress.active_workers,
                remaining = progress.remaining,
                "batch progress"
            );
        }
    });
    // Log lines are already mirrored to tracing; keep the channel drained.
    tokio::spawn(async move { while logs.recv().await.is_some() {} });

    let run_id = match engine
        .start(StartRequest {
            top_id,
            interval,
            workers,
            credentials,
        })
        .await
    {
        Ok(id) => id,
        Err(err) => {
            error!(%err, "scan not started");
            return Err(err.into());
        }
    };
    info!(%run_id, top_id, workers, "scan running; press Ctrl-C to stop");

    tokio::select! {
        summary = engine.wait() => match summary {
            Some(s) => info!(
                batches = s.batches,
                resolved = s.resolved,
                skipped = s.skipped,
                failed = s.failed,
                "scan finished"
            ),
            None => warn!("scan ended without a summary"),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("stop requested");
            let report = engine.stop().await;
            if report.timed_out {
                warn!("workers did not exit within the join timeout");
            }
            if let Some(s) = report.summary {
                info!(resolved = s.resolved, skipped = s.skipped, failed = s.failed, "scan stopped");
            }
        }
    }

    Ok(())
}
