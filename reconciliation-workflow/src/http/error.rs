//! Error translation for the HTTP API.

use crate::error::WorkflowError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use service_core::error::AppError;

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: &'static str,
    error: String,
}

pub fn status_for(err: &WorkflowError) -> StatusCode {
    match err {
        WorkflowError::InvalidTransition { .. }
        | WorkflowError::ProposalNotPending { .. }
        | WorkflowError::TransactionAlreadyMatched { .. }
        | WorkflowError::EntityAlreadyLinked { .. } => StatusCode::CONFLICT,
        WorkflowError::NotFound(_) => StatusCode::NOT_FOUND,
        WorkflowError::InvalidAction(_)
        | WorkflowError::InvalidProposal(_)
        | WorkflowError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
        WorkflowError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for WorkflowError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        let body = ErrorBody {
            kind: self.kind(),
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Handler error: a workflow failure or an infrastructure one.
#[derive(Debug)]
pub enum ApiError {
    Workflow(WorkflowError),
    App(AppError),
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        Self::Workflow(err)
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self::App(err)
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::App(AppError::ValidationError(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Workflow(err) => err.into_response(),
            Self::App(err) => err.into_response(),
        }
    }
}
