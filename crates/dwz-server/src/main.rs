//! DWZ Import Server - Main entry point

use anyhow::Result;
use dwz_common::logging::{init_logging, LogConfig};
use std::{net::SocketAddr, time::Duration};
use tokio::signal;
use tracing::info;

use dwz_server::{
    api,
    config::Config,
    import::{ImportConfig, ImportOrchestrator},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with configuration from environment
    let log_config = LogConfig::builder()
        .log_file_prefix("dwz-server".to_string())
        .filter_directives("dwz_server=debug,tower_http=debug,sqlx=warn".to_string())
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env()?;

    let _guard = init_logging(&log_config)?;

    info!("Starting DWZ Import Server");

    let config = Config::load()?;
    info!(
        "Configuration loaded - server will bind to {}:{}",
        config.server.host, config.server.port
    );

    let import_config = ImportConfig::load(config.import_config_path.as_deref())?;
    info!(
        remote = %import_config.remote.address(),
        targets = ?import_config.databases.target_names(),
        schedule_enabled = import_config.schedule.enabled,
        "Import configuration loaded"
    );

    let orchestrator = ImportOrchestrator::new(import_config)?;
    orchestrator.start();

    let app = api::create_router(orchestrator.clone());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.shutdown_timeout_secs))
        .await?;

    orchestrator.stop().await;
    if orchestrator.is_running() {
        info!("An import run is still in flight and will be abandoned");
    }

    info!("Server shut down gracefully");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    // Give ongoing requests time to complete
    info!("Waiting up to {} seconds for connections to close", timeout_secs);
    tokio::time::sleep(Duration::from_secs(timeout_secs.min(5))).await;
}
