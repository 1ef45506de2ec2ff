use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use pod_request_scheduler::transport::HttpPodTransport;
use pod_request_scheduler::{config, db, qadu};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let transport = Arc::new(HttpPodTransport::from_config(&cfg)?);
    let scheduler = Arc::new(qadu::new_scheduler(pool, &cfg, transport));
    scheduler.activate(cfg.requests.interval()).await;

    tokio::signal::ctrl_c().await?;
    info!(scheduler = scheduler.description(), "shutting down");
    scheduler.deactivate().await;

    Ok(())
}
