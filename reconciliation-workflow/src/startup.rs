//! Application startup and lifecycle management.

use crate::collaborators::{
    Collaborators, HttpEntityService, HttpSuggestionEngine, InMemoryEntities,
};
use crate::config::WorkflowConfig;
use crate::http::{self, AppState};
use crate::services::{get_metrics, init_metrics, ReconciliationWorkflow};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use service_core::error::AppError;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "reconciliation-workflow",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check() -> impl IntoResponse {
    tracing::debug!("Readiness check passed");
    StatusCode::OK
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    match get_metrics() {
        Ok(metrics) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            metrics,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                String::new(),
            )
        }
    }
}

/// Remote collaborators where URLs are configured, in-process ones otherwise.
pub fn collaborators_from_config(config: &WorkflowConfig) -> Collaborators {
    let mut collaborators = Collaborators::in_process(Arc::new(InMemoryEntities::new()));

    if let Some(url) = &config.suggestion_engine.url {
        tracing::info!(endpoint = %url, "Using remote suggestion engine");
        collaborators.suggestions = Arc::new(HttpSuggestionEngine::new(url.as_str()));
    }
    if let Some(url) = &config.entity_service.url {
        tracing::info!(endpoint = %url, "Using remote entity service");
        let service = Arc::new(HttpEntityService::new(url.as_str()));
        collaborators.entities = service.clone();
        collaborators.expenses = service;
    }

    collaborators
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with collaborators chosen from the configuration.
    pub async fn build(config: WorkflowConfig) -> Result<Self, AppError> {
        let collaborators = collaborators_from_config(&config);
        Self::build_with(config, collaborators).await
    }

    /// Build the application against the given collaborators.
    pub async fn build_with(
        config: WorkflowConfig,
        collaborators: Collaborators,
    ) -> Result<Self, AppError> {
        // Initialize metrics
        init_metrics();

        let workflow = Arc::new(ReconciliationWorkflow::new(
            collaborators,
            config.workflow_settings(),
        ));
        let state = AppState { workflow };

        let http_addr = config.common.socket_addr();
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Reconciliation workflow listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn workflow(&self) -> Arc<ReconciliationWorkflow> {
        self.state.workflow.clone()
    }

    pub fn router(&self) -> Router {
        let operational = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler));

        http::router(self.state.clone(), operational)
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = self.router();

        tracing::info!(
            service = "reconciliation-workflow",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        axum::serve(self.http_listener, router).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
