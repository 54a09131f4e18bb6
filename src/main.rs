use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use imgu_sync::api::{self, AppState};
use imgu_sync::config::{self, Config};
use imgu_sync::control::{StartOutcome, SyncController};
use imgu_sync::db::{self, Pool};
use imgu_sync::engine::LocalEngine;
use imgu_sync::model::SyncStatus;
use imgu_sync::steps::SyncSteps;

#[derive(Debug, Parser)]
#[command(author, version, about = "Resumable Unsplash to R2 photo sync")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the operator HTTP API and run syncs in this process
    Serve,
    /// Start or resume one sync and wait until it finishes
    Run {
        /// Seconds between status polls
        #[arg(long, default_value = "5")]
        poll_seconds: u64,
    },
    /// Print an example config file
    ExampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(args.config.as_path()))
        .with_context(|| format!("load {}", args.config.display()))?;
    cfg.ensure_dirs()?;
    let (pool, engine, controller) = wire(&cfg).await?;

    match args.command {
        Command::Serve => serve(&cfg, pool, engine, controller).await,
        Command::Run { poll_seconds } => run_once(engine, controller, poll_seconds).await,
        Command::ExampleConfig => Ok(()),
    }
}

async fn wire(cfg: &Config) -> Result<(Pool, LocalEngine, Arc<SyncController>)> {
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let steps = Arc::new(SyncSteps::from_config(pool.clone(), cfg)?);
    let engine = LocalEngine::new(
        steps,
        cfg.sync.retry.clone(),
        cfg.sync.max_duration_secs.map(Duration::from_secs),
    );
    let controller = Arc::new(SyncController::from_config(
        pool.clone(),
        Arc::new(engine.clone()),
        cfg,
    ));
    Ok((pool, engine, controller))
}

async fn serve(
    cfg: &Config,
    pool: Pool,
    engine: LocalEngine,
    controller: Arc<SyncController>,
) -> Result<()> {
    let app = api::router(AppState { pool, controller }, &cfg.server.allowed_origin);
    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("bind {}", cfg.server.bind))?;
    info!(addr = %listener.local_addr()?, "operator API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
            }
        })
        .await?;

    engine.shutdown().await;
    info!("all executions finalized");
    Ok(())
}

async fn run_once(
    engine: LocalEngine,
    controller: Arc<SyncController>,
    poll_seconds: u64,
) -> Result<()> {
    match controller.start().await? {
        StartOutcome::Started {
            execution_arn,
            resumed_from_page,
        } => info!(%execution_arn, resumed_from_page, "sync started"),
        StartOutcome::Conflict { existing_arn } => {
            bail!("a sync is already running: {}", existing_arn.unwrap_or_default())
        }
    }

    let poll = Duration::from_secs(poll_seconds.max(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stop_sent = false;

    let status = loop {
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            res = &mut ctrl_c, if !stop_sent => {
                res?;
                warn!("interrupted; stopping sync");
                controller.stop(None).await?;
                stop_sent = true;
            }
        }
        let report = controller.status().await?;
        if report.status.is_terminal() || report.status == SyncStatus::Idle {
            break report.status;
        }
    };

    engine.shutdown().await;
    let summary = controller.summary().await?;
    info!(
        %status,
        items = summary.overall_item_count,
        storage = %summary.overall_storage_human,
        last_processed_page = ?summary.last_processed_page,
        "sync finished"
    );
    match status {
        SyncStatus::Failed | SyncStatus::TimedOut => bail!("sync ended with {status}"),
        _ => Ok(()),
    }
}
