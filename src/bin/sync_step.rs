use anyhow::{Context, Result};
use clap::Parser;
use std::io::Read;
use std::path::PathBuf;
use tracing::debug;

use imgu_sync::config;
use imgu_sync::db;
use imgu_sync::steps::{StepRequest, SyncSteps};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run one sync step: read a JSON step request on stdin, print the JSON response"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Pretty-print the response
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(args.config.as_path()))?;
    cfg.ensure_dirs()?;

    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("read step request from stdin")?;
    let request: StepRequest = serde_json::from_str(&input).context("parse step request")?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let steps = SyncSteps::from_config(pool, &cfg)?;

    debug!(?request, "dispatching step");
    let response = steps.dispatch(request).await?;
    let out = if args.pretty {
        serde_json::to_string_pretty(&response)?
    } else {
        serde_json::to_string(&response)?
    };
    println!("{out}");
    Ok(())
}
