mod clock;
mod config;
mod db;
mod error;
mod executor;
mod schedule;
mod valve;
mod web;
mod zone;

use anyhow::{Context, Result};
use std::{env, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use clock::SystemClock;
use db::Db;
use executor::{Executor, ExecutorConfig, ZoneTable};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // The local offset can only be read while the process is single-threaded.
    let clock = Arc::new(SystemClock::local());

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(run(clock))
}

async fn run(clock: Arc<SystemClock>) -> Result<()> {
    // ── Env config ──────────────────────────────────────────────────
    let db_url = env::var("DB_URL")
        .unwrap_or_else(|_| "sqlite:irrigation.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let port = web::port_from_env();
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (ceiling + zone seed) ────────────────────────────
    let cfg = config::load_or_default(&config_path)?;
    config::apply(&cfg, &db).await?;

    // The database is the source of truth from here on.
    let max_open_seconds = db.max_open_seconds().await?;
    let zones: Vec<_> = db
        .load_all_zones()
        .await?
        .into_iter()
        .map(|zone| zone.with_max_open_seconds(max_open_seconds))
        .collect();
    if zones.is_empty() {
        warn!("no zones configured in the database");
    }
    info!(zones = zones.len(), max_open_seconds, "db ready");

    // ── Valves + executor ───────────────────────────────────────────
    let table = ZoneTable::new(zones, valve::board(active_low)?)?;
    let executor = Arc::new(Executor::new(
        table,
        db.clone(),
        clock,
        ExecutorConfig {
            poll_interval: cfg.poll_interval(),
            max_open_seconds,
        },
    ));
    executor.start().await?;

    // ── Web server (runs until Ctrl-C / SIGTERM) ────────────────────
    let served = web::serve(Arc::clone(&executor), port, shutdown_signal()).await;

    executor.stop().await;
    db.close().await;
    info!("controller stopped");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
