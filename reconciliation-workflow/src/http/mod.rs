//! HTTP/JSON surface of the workflow.

pub mod error;
pub mod handlers;

use crate::services::{record_http_request, ReconciliationWorkflow};
use axum::extract::{MatchedPath, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use service_core::middleware::request_id_middleware;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

pub use error::ApiError;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub workflow: Arc<ReconciliationWorkflow>,
}

/// Records request count and latency per matched route.
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;

    record_http_request(
        &method,
        &route,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

/// Client-scoped API routes.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route(
            "/clients/:client_id/transactions",
            get(handlers::list_transactions),
        )
        .route(
            "/clients/:client_id/transactions/:transaction_id",
            get(handlers::get_transaction),
        )
        .route(
            "/clients/:client_id/transactions/:transaction_id/proposals",
            get(handlers::list_proposals),
        )
        .route(
            "/clients/:client_id/transactions/:transaction_id/actions",
            post(handlers::apply_action),
        )
        .route(
            "/clients/:client_id/proposals/generate",
            post(handlers::generate_proposals),
        )
        .route(
            "/clients/:client_id/proposals/:proposal_id/accept",
            post(handlers::accept_proposal),
        )
        .route(
            "/clients/:client_id/proposals/:proposal_id/reject",
            post(handlers::reject_proposal),
        )
        .route("/clients/:client_id/kpi", get(handlers::compute_kpi))
        .route("/clients/:client_id/imports", post(handlers::import_file))
}

/// Full router: `/api/v1` plus the given operational routes, with request
/// ids, tracing and metrics applied to everything.
pub fn router(state: AppState, operational: Router<AppState>) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .merge(operational)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}
