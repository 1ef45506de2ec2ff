use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use pod_request_scheduler::transport::HttpPodTransport;
use pod_request_scheduler::{config, db, qadu};

#[derive(Debug, Parser)]
#[command(author, version, about = "Print pending request statistics as JSON")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Also list the pending requests of this pod
    #[arg(long)]
    pod: Option<i64>,
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

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let transport = Arc::new(HttpPodTransport::from_config(&cfg)?);
    let scheduler = qadu::new_scheduler(pool.clone(), &cfg, transport);
    info!(scheduler = scheduler.description(), "collecting statistics");
    let stats = scheduler.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    if let Some(pod_id) = args.pod {
        let pending = db::list_pending_qadu_for_pod(&pool, pod_id).await?;
        println!("{}", serde_json::to_string_pretty(&pending)?);
    }

    Ok(())
}
