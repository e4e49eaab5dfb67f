//! Sync Engine Binary
//!
//! Starts the broker reconciliation service: opens the journal store and
//! runs the listener supervisor until SIGTERM/Ctrl+C.
//!
//! # Environment Variables
//!
//! - `DB_PATH`: Path to the journal SQLite database (default: ./trade_journal.db)
//! - `RUST_LOG`: Log level (default: info)
//! - `SYNC_*`: Reconciliation tuning overrides (see `config::SyncSettings`)

use anyhow::Context;
use sync_engine::{AccountStore, EngineConfig, SyncManager, TradeStore, telemetry};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    dotenvy::dotenv().ok();
    telemetry::init();

    let config = EngineConfig::from_env();
    tracing::info!(
        db_path = %config.store.database_path,
        supervisor_interval_secs = config.sync.supervisor_interval.as_secs(),
        "starting sync engine"
    );

    let pool = sync_engine::store::connect(&config.store.database_url())
        .await
        .context("failed to open journal store")?;

    let manager = SyncManager::new(
        AccountStore::new(pool.clone()),
        TradeStore::new(pool),
        config.sync,
    );

    let shutdown = CancellationToken::new();

    // First pass immediately so linked accounts get listeners at startup.
    manager.reconcile_listeners().await;

    let supervisor = tokio::spawn(manager.clone().run_supervisor(shutdown.clone()));

    tracing::info!("sync engine ready");
    await_shutdown().await;
    shutdown.cancel();

    supervisor.await.ok();
    tracing::info!("sync engine stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
    }
}
