use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use speedy_routing::config;
use speedy_routing::db;
use speedy_routing::http::{create_router, AppState};
use speedy_routing::manager::RouteManager;
use speedy_routing::notify;
use speedy_routing::outbox;
use speedy_routing::scheduler;

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

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/routing.db", cfg.app.resolved_data_dir()));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let notifier = notify::from_config(&cfg.notifications)?;
    outbox::spawn_worker(
        pool.clone(),
        notifier,
        Duration::from_millis(cfg.app.poll_interval_ms),
        cfg.app.max_backoff_seconds as i64,
    );

    let manager = Arc::new(RouteManager::new(pool, &cfg));
    manager.recover_interrupted_run().await?;
    if cfg.scheduler.enabled {
        info!(tick_seconds = cfg.scheduler.tick_seconds, "starting auto-routing scheduler");
        scheduler::spawn(manager.clone(), Duration::from_secs(cfg.scheduler.tick_seconds));
    }

    let app = create_router(AppState::from_config(manager, &cfg));
    let addr = cfg.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    Ok(())
}
