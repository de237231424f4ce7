//! # Tally Sync Server
//!
//! Runs the POS ↔ CRM sync engine as a daemon.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  load config ─► open SQLite (migrations) ─► build CrmClient             │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  spawn processor loop      (interval_secs, first cycle immediately)     │
//! │  spawn reconciliation loop (daily, first pass after one interval)       │
//! │  serve webhook router      (public bind_addr)                           │
//! │  serve admin router        (loopback admin_bind_addr)                   │
//! │        │                                                                │
//! │        ▼  Ctrl+C / SIGTERM                                              │
//! │  stop listeners ─► stop timers (in-flight cycle finishes) ─► close DB   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```text
//! sync-server [path/to/sync.toml]
//! RUST_LOG=tally_sync=debug sync-server
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tally_db::{Database, DbConfig};
use tally_sync::{
    AdminState, CrmClient, ReconciliationEngine, SyncConfig, SyncLogRetryJob, SyncProcessor,
    TimerHandle, WebhookState, WebhookVerifier,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("Starting Tally sync server...");

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = SyncConfig::load(config_path).context("loading sync configuration")?;
    info!(
        crm = %config.crm.base_url,
        database = ?config.database.path,
        interval_secs = config.processor.interval_secs,
        "Configuration loaded"
    );

    let db = Database::new(DbConfig::new(&config.database.path))
        .await
        .context("opening database")?;
    let crm = CrmClient::new(&config.crm, db.clone()).context("building CRM client")?;

    let processor = Arc::new(SyncProcessor::new(
        db.clone(),
        crm.clone(),
        config.processor.clone(),
    ));
    let reconciliation = Arc::new(ReconciliationEngine::new(
        db.clone(),
        crm.clone(),
        config.reconciliation.clone(),
    ));

    // Background loops
    let mut timers = Vec::new();
    if config.crm.enabled && config.processor.enabled {
        let (handle, rx) = TimerHandle::new();
        tokio::spawn(processor.clone().run(rx));
        timers.push(handle);
    } else {
        warn!("Sync processor disabled by configuration");
    }
    if config.crm.enabled && config.reconciliation.enabled {
        let (handle, rx) = TimerHandle::new();
        tokio::spawn(reconciliation.clone().run(rx));
        timers.push(handle);
    } else {
        warn!("Loyalty reconciliation disabled by configuration");
    }

    // HTTP listeners
    let (stop_tx, stop_rx) = watch::channel(false);

    let webhook_app = tally_sync::http::webhook::router(WebhookState {
        db: db.clone(),
        verifier: WebhookVerifier::from_config(&config),
    });
    let admin_app = tally_sync::http::admin::router(AdminState {
        db: db.clone(),
        crm: crm.clone(),
        log_retry: SyncLogRetryJob::new(db.clone(), crm, processor.scheduler().clone()),
        processor,
        reconciliation,
        max_attempts: config.processor.max_attempts,
    });

    let servers = [
        serve("webhook", &config.webhook.bind_addr, webhook_app, stop_rx.clone()).await?,
        serve("admin", &config.webhook.admin_bind_addr, admin_app, stop_rx).await?,
    ];

    shutdown_signal().await;

    let _ = stop_tx.send(true);
    for server in servers {
        if let Err(e) = server.await {
            error!(error = %e, "Listener task panicked");
        }
    }

    for timer in timers {
        if let Err(e) = timer.shutdown().await {
            warn!(error = %e, "Timer already stopped");
        }
    }

    db.close().await;
    info!("Server shutdown complete");
    Ok(())
}

/// Binds `addr` and serves `app` until the stop flag flips.
async fn serve(
    name: &'static str,
    addr: &str,
    app: Router,
    mut stop_rx: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {name} listener on {addr}"))?;
    info!(listener = name, addr = %addr, "HTTP listener started");

    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.wait_for(|stop| *stop).await;
            })
            .await;
        if let Err(e) = result {
            error!(listener = name, error = %e, "HTTP listener failed");
        }
    }))
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
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

    info!("Shutdown signal received, starting graceful shutdown...");
}
