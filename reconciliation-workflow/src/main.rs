//! Reconciliation Workflow entry point.

use reconciliation_workflow::config::WorkflowConfig;
use reconciliation_workflow::services::init_metrics;
use reconciliation_workflow::startup::Application;

use service_core::observability::init_tracing;
use tokio::signal;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load configuration
    let config = WorkflowConfig::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    // Initialize tracing
    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )
    .map_err(|e| std::io::Error::other(format!("Tracing setup error: {}", e)))?;

    tracing::info!(
        version = %config.service_version,
        otlp_endpoint = config.otlp_endpoint.as_deref().unwrap_or("disabled"),
        "Starting reconciliation-workflow"
    );

    // Initialize metrics
    init_metrics();

    tracing::info!(
        service_name = %config.service_name,
        http_port = %config.common.port,
        default_page_size = config.paging.default_page_size,
        max_page_size = config.paging.max_page_size,
        idempotency_retention_secs = config.idempotency.retention_secs,
        suggestion_engine_url = config.suggestion_engine.url.as_deref().unwrap_or("in-process"),
        entity_service_url = config.entity_service.url.as_deref().unwrap_or("in-process"),
        "Configuration loaded"
    );

    // Build and run application
    let app = Application::build(config).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to build application");
        std::io::Error::other(format!("Application build error: {}", e))
    })?;

    // Run with graceful shutdown
    tokio::select! {
        result = app.run_until_stopped() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Application error");
                return Err(e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("Graceful shutdown initiated");
        }
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}
