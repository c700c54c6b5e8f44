use std::sync::Arc;
use std::time::Duration;

use beacon::api::{ApiServer, AppState};
use beacon::logging::init_logging;
use beacon::services::FinalFlush;
use beacon::utils::http_client::install_rustls_provider;
use beacon::{ServiceConfig, TelemetryService};
use tokio::task::JoinError;
use tracing::{error, info, warn};

/// Budget for the HTTP server to drain after shutdown.
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = ServiceConfig::from_env()?;

    let (logging_config, _log_guard) = init_logging(config.log_dir.as_deref())?;
    install_rustls_provider();

    info!(
        service = %config.service_name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting beacon"
    );

    let service = TelemetryService::init(config).await?;

    let state = AppState::new(Arc::clone(&service)).with_logging_config(logging_config);
    let server = Arc::new(ApiServer::new(service.config().server.clone(), state));

    let mut server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    let server_running = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            true
        }
        result = &mut server_task => {
            log_server_exit(result);
            false
        }
    };

    let report = service.shutdown().await;
    server.shutdown();

    if server_running {
        // Let in-flight HTTP requests finish before the runtime goes away.
        match tokio::time::timeout(SERVER_DRAIN_TIMEOUT, server_task).await {
            Ok(result) => log_server_exit(result),
            Err(_) => warn!(timeout = ?SERVER_DRAIN_TIMEOUT, "API server did not stop in time"),
        }
    }

    match report.final_flush {
        FinalFlush::Failed { sent, requeued } => {
            warn!(sent, requeued, "Exited with unsent metrics")
        }
        _ => info!(elapsed = ?report.elapsed, forced = report.forced, "beacon stopped"),
    }

    Ok(())
}

fn log_server_exit(result: Result<beacon::Result<()>, JoinError>) {
    match result {
        Ok(Ok(())) => info!("API server exited"),
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task panicked"),
    }
}

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
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
