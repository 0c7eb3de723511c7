//! Tarhal Dispatch Core — service binary.
//!
//! Boots the full dispatch engine: storage, the captain queue actor, the
//! dispatch supervisor, the payment retry worker, the tracking expiry
//! sweep, and the HTTP/WebSocket server, all joined under one cancellation
//! token for graceful shutdown.
//!
//! # Environment Variables
//!
//! - `TARHAL_CONFIG`: path to the TOML config file (default `dispatch.toml`)
//! - `TARHAL_TOKENS`: path to the static token table
//! - `RUST_LOG`: logging filter (default `info`)

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tarhal::app::build;
use tarhal::auth::{Authenticator, TokenRegistry};
use tarhal::config::AppConfig;
use tarhal::notify::NotifyPort;
use tarhal::store::Storage;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "tarhal")]
#[command(about = "Tarhal Dispatch Core - realtime ride dispatch engine")]
#[command(version)]
struct CliArgs {
    /// Override the server bind address (default from config, "0.0.0.0:8080")
    #[arg(short, long)]
    addr: Option<String>,

    /// Override the data directory for the embedded store
    #[arg(long)]
    data_dir: Option<String>,

    /// Path to the static token table (TOML). Also via TARHAL_TOKENS.
    #[arg(long, env = "TARHAL_TOKENS")]
    tokens: Option<String>,

    /// Emit logs as JSON (for log shipping)
    #[arg(long)]
    json_logs: bool,
}

/// Names for the supervised tasks, for shutdown reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskName {
    HttpServer,
    QueueManager,
    DispatchSupervisor,
    PendingTransfers,
    TrackingExpiry,
    ConfigWatcher,
}

fn init_tracing(json: bool) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.json_logs);
    info!("Tarhal Dispatch Core starting");

    // Fail-closed configuration load.
    let mut config = AppConfig::load().context("configuration rejected")?;
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    if let Some(data_dir) = args.data_dir {
        config.server.data_dir = data_dir;
    }

    let auth: Arc<dyn Authenticator> = match &args.tokens {
        Some(path) => Arc::new(TokenRegistry::from_file(path).context("token table rejected")?),
        None => {
            warn!("No token table configured; every realtime handshake will be refused");
            Arc::new(TokenRegistry::new())
        }
    };

    let storage = Storage::open(&config.server.data_dir).context("storage open failed")?;

    // Shutdown plumbing: Ctrl+C cancels everything.
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let built = build(&config, storage, auth, cancel_token.clone())
        .context("service wiring failed")?;
    let app = built.app.clone();

    // ------------------------------------------------------------------
    // JoinSet supervisor pattern
    // ------------------------------------------------------------------
    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    // HTTP + WebSocket server
    {
        let router = tarhal::api::create_router(app.clone());
        let addr = config.server.addr.clone();
        let cancel = cancel_token.clone();
        task_set.spawn(async move {
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("could not bind {addr}"))?;
            info!(addr = %addr, "HTTP server listening");
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                    info!("[HttpServer] Received shutdown signal");
                })
                .await
                .context("server error")?;
            info!("[HttpServer] Graceful shutdown complete");
            Ok(TaskName::HttpServer)
        });
    }

    // Captain queue actor (already spawned by build; adopt its handle).
    {
        let queue_task = built.queue_task;
        task_set.spawn(async move {
            queue_task.await.ok();
            Ok(TaskName::QueueManager)
        });
    }

    // Dispatch supervisor
    {
        let supervisor = built.supervisor;
        task_set.spawn(async move {
            supervisor.run().await;
            Ok(TaskName::DispatchSupervisor)
        });
    }

    // Pending transfer retry worker
    {
        let ledger = app.storage.ledger.clone();
        let settings = app.settings.clone();
        let cancel = cancel_token.clone();
        task_set.spawn(async move {
            tarhal::payment::run_pending_transfer_worker(ledger, settings, cancel).await;
            Ok(TaskName::PendingTransfers)
        });
    }

    // Tracking expiry sweep
    {
        let tracking = app.tracking.clone();
        let cancel = cancel_token.clone();
        task_set.spawn(async move {
            tarhal::tracking::run_expiry_sweep(tracking, cancel).await;
            Ok(TaskName::TrackingExpiry)
        });
    }

    // Config hot reload (only when a config file actually exists)
    let config_path = std::path::PathBuf::from(tarhal::config::config_path());
    if config_path.exists() {
        let settings = app.settings.clone();
        let cancel = cancel_token.clone();
        let (reload_tx, mut reload_rx) = tokio::sync::mpsc::channel(8);
        task_set.spawn(async move {
            tarhal::config::watcher::run_config_watcher(config_path, settings, reload_tx, cancel)
                .await;
            Ok(TaskName::ConfigWatcher)
        });

        // Consumer: persist reloaded settings and tell connected captains.
        let app_for_reload = app.clone();
        tokio::spawn(async move {
            use tarhal::config::watcher::SettingsEvent;
            while let Some(event) = reload_rx.recv().await {
                match event {
                    SettingsEvent::Reloaded(changes) => {
                        let settings = app_for_reload.settings.current().as_ref().clone();
                        if let Err(err) = app_for_reload.storage.settings.save(&settings) {
                            warn!(error = %err, "Could not persist reloaded settings");
                        }
                        let captains = app_for_reload.presence.online_captains().await;
                        for captain_id in &captains {
                            app_for_reload
                                .notifier
                                .notify_captain(
                                    captain_id,
                                    tarhal::protocol::CaptainEvent::SettingsUpdated(
                                        settings.clone(),
                                    ),
                                )
                                .await;
                        }
                        info!(
                            changes = changes.len(),
                            notified_captains = captains.len(),
                            "Reloaded settings applied"
                        );
                    }
                    SettingsEvent::Error(err) => {
                        warn!(error = %err, "Config reload rejected");
                    }
                }
            }
        });
    }

    info!("All tasks spawned, supervising");
    while let Some(joined) = task_set.join_next().await {
        match joined {
            Ok(Ok(name)) => info!(task = ?name, "Task finished"),
            Ok(Err(err)) => {
                error!(error = %err, "Task failed, shutting down");
                cancel_token.cancel();
            }
            Err(err) => {
                error!(error = %err, "Task panicked, shutting down");
                cancel_token.cancel();
            }
        }
    }

    info!("Tarhal Dispatch Core stopped");
    Ok(())
}
