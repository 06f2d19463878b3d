use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use ccgw_config::ConfigStore;
use ccgw_core::GatewayState;
use ccgw_provider::{ConnectorConfig, WreqConnector};
use ccgw_storage::GatewayStorage;
use ccgw_vault::Vault;

mod cli;
mod home;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);
const RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let home = home::resolve(cli.home.as_deref())?;
    std::fs::create_dir_all(&home)
        .with_context(|| format!("create gateway home {}", home.display()))?;

    let vault = Vault::open(&home.join("secret.key")).context("open secret vault")?;
    let config = Arc::new(
        ConfigStore::load_or_init(home.join("config.json"), vault).context("load config")?,
    );

    let dsn = format!("sqlite://{}?mode=rwc", home.join("cc-gw.db").display());
    let storage = GatewayStorage::connect(&dsn).await.context("open database")?;
    storage.sync().await.context("sync database schema")?;

    let connector = Arc::new(WreqConnector::new(ConnectorConfig::default()));
    let state = GatewayState::new(config.clone(), storage.clone(), connector);

    spawn_retention_sweeper(state.clone());

    let mut app = axum::Router::new()
        .nest("/api", ccgw_api::management_router(state.clone()))
        .merge(ccgw_api::public_router(state.clone()));
    if let Some(ui_root) = &cli.ui_root {
        let serve = tower_http::services::ServeDir::new(ui_root)
            .append_index_html_on_directories(true);
        app = app.fallback_service(serve);
        info!(event = "ui_enabled", root = %ui_root.display());
    }

    let snapshot = config.snapshot();
    let host = cli.host.clone().unwrap_or_else(|| snapshot.host.clone());
    let port = cli.port.unwrap_or(snapshot.port);
    let bind = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;

    let pid_path = home.join("cc-gw.pid");
    if let Err(err) = std::fs::write(&pid_path, std::process::id().to_string()) {
        warn!(event = "pid_file_write_failed", error = %err);
    }

    storage
        .append_event(
            "info",
            "startup",
            &format!("listening on {bind}"),
            Some(serde_json::json!({"pid": std::process::id()})),
        )
        .await
        .ok();
    info!(event = "listening", bind = %bind);

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Give in-flight requests a moment to finalize their log rows.
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while state.active_requests() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    storage
        .append_event("info", "shutdown", "gateway stopped", None)
        .await
        .ok();
    if let Err(err) = std::fs::remove_file(&pid_path) {
        warn!(event = "pid_file_remove_failed", error = %err);
    }

    serve_result.context("server error")?;
    Ok(())
}

fn spawn_retention_sweeper(state: Arc<GatewayState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let days = state.config.snapshot().log_retention_days;
            if days == 0 {
                continue;
            }
            let cutoff = time_now_minus_days(days);
            match state.storage.delete_logs_before(cutoff).await {
                Ok(deleted) if deleted > 0 => {
                    let _ = state
                        .storage
                        .append_event(
                            "info",
                            "retention_sweep",
                            &format!("deleted {deleted} expired request logs"),
                            None,
                        )
                        .await;
                }
                Ok(_) => {}
                Err(err) => warn!(event = "retention_sweep_failed", error = %err),
            }
        }
    });
}

fn time_now_minus_days(days: u32) -> time::OffsetDateTime {
    time::OffsetDateTime::now_utc() - time::Duration::days(days as i64)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!(event = "shutdown_signal_received");
}
