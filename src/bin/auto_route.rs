use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use speedy_routing::config;
use speedy_routing::db;
use speedy_routing::manager::RouteManager;

#[derive(Debug, Parser)]
#[command(author, version, about = "Run one auto-routing pass and print the report as JSON")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run even when auto-routing is disabled in the routing settings
    #[arg(long)]
    force: bool,

    /// Actor recorded in the audit log
    #[arg(long, default_value = "cli")]
    actor: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/routing.db", cfg.app.resolved_data_dir()));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let manager = RouteManager::new(pool, &cfg);
    let report = manager.run_auto_routing(&args.actor, args.force).await?;
    info!(
        success = report.success,
        routes = report.routes_created,
        duration_ms = report.duration_ms,
        "auto-routing pass finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
