//! HTTP handlers over the workflow facade.

use crate::collaborators::ImportFile;
use crate::error::WorkflowError;
use crate::http::error::ApiError;
use crate::http::AppState;
use crate::models::{
    ActionResult, BankTransaction, GenerateOutcome, ImportSummary, Kpi, MatchProposal,
    PageRequest, ReconciliationAction, TransactionFilter, TransactionPage, TransactionStatus,
};
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::NaiveDate;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct ListTransactionsQuery {
    pub status: Option<String>,
    #[validate(length(max = 200))]
    pub query: Option<String>,
    #[validate(range(min = 1))]
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl ListTransactionsQuery {
    fn into_filter(self) -> Result<(TransactionFilter, PageRequest), WorkflowError> {
        let status = match self.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(TransactionStatus::parse(raw).ok_or_else(|| {
                WorkflowError::InvalidRequest(format!("unknown status '{}'", raw))
            })?),
            None => None,
        };

        Ok((
            TransactionFilter {
                status,
                query: self.query,
            },
            PageRequest::new(self.page.unwrap_or(1), self.page_size.unwrap_or(0)),
        ))
    }
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
    Query(params): Query<ListTransactionsQuery>,
) -> Result<Json<TransactionPage>, ApiError> {
    params.validate()?;
    let (filter, page) = params.into_filter()?;
    let page = state
        .workflow
        .list_transactions(client_id, filter, page)
        .await?;
    Ok(Json(page))
}

pub async fn get_transaction(
    State(state): State<AppState>,
    Path((client_id, transaction_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<BankTransaction>, ApiError> {
    let transaction = state
        .workflow
        .get_transaction(client_id, transaction_id)
        .await?;
    Ok(Json(transaction))
}

pub async fn list_proposals(
    State(state): State<AppState>,
    Path((client_id, transaction_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Vec<MatchProposal>>, ApiError> {
    let proposals = state
        .workflow
        .list_proposals(client_id, transaction_id)
        .await?;
    Ok(Json(proposals))
}

pub async fn apply_action(
    State(state): State<AppState>,
    Path((client_id, transaction_id)): Path<(Uuid, Uuid)>,
    payload: Result<Json<ReconciliationAction>, JsonRejection>,
) -> Result<Json<ActionResult>, ApiError> {
    let Json(action) =
        payload.map_err(|rejection| WorkflowError::InvalidAction(rejection.body_text()))?;
    let result = state
        .workflow
        .apply_action(client_id, transaction_id, action)
        .await?;
    Ok(Json(result))
}

pub async fn generate_proposals(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
) -> Result<Json<GenerateOutcome>, ApiError> {
    let outcome = state.workflow.generate_proposals(client_id).await?;
    Ok(Json(outcome))
}

pub async fn accept_proposal(
    State(state): State<AppState>,
    Path((client_id, proposal_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ActionResult>, ApiError> {
    let result = state
        .workflow
        .accept_proposal(client_id, proposal_id)
        .await?;
    Ok(Json(result))
}

pub async fn reject_proposal(
    State(state): State<AppState>,
    Path((client_id, proposal_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ActionResult>, ApiError> {
    let result = state
        .workflow
        .reject_proposal(client_id, proposal_id)
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct KpiQuery {
    pub as_of: Option<NaiveDate>,
}

pub async fn compute_kpi(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
    Query(params): Query<KpiQuery>,
) -> Result<Json<Kpi>, ApiError> {
    let kpi = match params.as_of {
        Some(as_of) => state.workflow.compute_kpi_as_of(client_id, as_of).await?,
        None => state.workflow.compute_kpi(client_id).await?,
    };
    Ok(Json(kpi))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ImportQuery {
    #[validate(length(max = 42))]
    pub iban: Option<String>,
    #[validate(length(max = 100))]
    pub bank_name: Option<String>,
    #[validate(length(min = 1, max = 255))]
    pub file_name: Option<String>,
}

/// The statement file is the raw request body.
pub async fn import_file(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
    Query(params): Query<ImportQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<ImportSummary>), ApiError> {
    params.validate()?;
    let file = ImportFile {
        file_name: params
            .file_name
            .unwrap_or_else(|| "statement.csv".to_string()),
        content: body.to_vec(),
    };

    let summary = state
        .workflow
        .import_file(client_id, file, params.iban, params.bank_name)
        .await?;
    Ok((StatusCode::CREATED, Json(summary)))
}
