//! reqwest clients for remotely hosted collaborators.
//!
//! Lookups and suggestion requests are retried with backoff on transport
//! failures, 429 and 5xx. Expense creation is a write and is sent once.

use crate::collaborators::{Candidate, EntityDirectory, ExpenseDraft, ExpenseService, SuggestionEngine};
use crate::error::WorkflowError;
use crate::models::{BankTransaction, EntityRef};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use service_core::middleware::{current_request_id, REQUEST_ID_HEADER};
use service_core::observability::inject_trace_context;
use service_core::retry::{retry_with_backoff, RetryConfig, Retryable};
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

const SUGGESTION_SERVICE: &str = "suggestion engine";
const ENTITY_SERVICE: &str = "entity service";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum CallError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("malformed response: {0}")]
    Decode(String),
}

impl Retryable for CallError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Decode(_) => false,
        }
    }
}

fn outbound_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(value) = current_request_id().and_then(|id| HeaderValue::from_str(&id).ok()) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    inject_trace_context(&mut headers);
    headers
}

fn build_client() -> Client {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

async fn read_error(response: reqwest::Response) -> CallError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    CallError::Status { status, body }
}

#[derive(Serialize)]
struct SuggestionRequest<'a> {
    client_id: Uuid,
    transaction: &'a BankTransaction,
}

#[derive(Deserialize)]
struct SuggestionResponse {
    candidates: Vec<Candidate>,
}

pub struct HttpSuggestionEngine {
    client: Client,
    base_url: String,
    retry: RetryConfig,
}

impl HttpSuggestionEngine {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: build_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn fetch(
        &self,
        client_id: Uuid,
        transaction: &BankTransaction,
    ) -> Result<Vec<Candidate>, CallError> {
        let response = self
            .client
            .post(format!("{}/suggestions", self.base_url))
            .headers(outbound_headers())
            .json(&SuggestionRequest {
                client_id,
                transaction,
            })
            .send()
            .await
            .map_err(|e| CallError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            return Err(read_error(response).await);
        }

        let body: SuggestionResponse = response
            .json()
            .await
            .map_err(|e| CallError::Decode(e.to_string()))?;
        Ok(body.candidates)
    }
}

#[async_trait]
impl SuggestionEngine for HttpSuggestionEngine {
    #[instrument(skip(self, transaction), fields(transaction_id = %transaction.transaction_id))]
    async fn suggest(
        &self,
        client_id: Uuid,
        transaction: &BankTransaction,
    ) -> Result<Vec<Candidate>, WorkflowError> {
        retry_with_backoff(&self.retry, "suggest", || self.fetch(client_id, transaction))
            .await
            .map_err(|e| WorkflowError::upstream(SUGGESTION_SERVICE, e.to_string()))
    }
}

#[derive(Deserialize)]
struct CreatedExpense {
    expense_id: Uuid,
}

#[derive(Serialize)]
struct CreateExpenseRequest<'a> {
    client_id: Uuid,
    #[serde(flatten)]
    draft: &'a ExpenseDraft,
}

/// Remote invoice/expense books.
pub struct HttpEntityService {
    client: Client,
    base_url: String,
    retry: RetryConfig,
}

impl HttpEntityService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: build_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn lookup(&self, client_id: Uuid, entity: &EntityRef) -> Result<bool, CallError> {
        let response = self
            .client
            .get(format!(
                "{}/entities/{}/{}",
                self.base_url,
                entity.entity_type.as_str(),
                entity.entity_id
            ))
            .query(&[("client_id", client_id.to_string())])
            .headers(outbound_headers())
            .send()
            .await
            .map_err(|e| CallError::Connection(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(read_error(response).await),
        }
    }
}

#[async_trait]
impl EntityDirectory for HttpEntityService {
    #[instrument(skip(self), fields(entity = %entity))]
    async fn entity_exists(
        &self,
        client_id: Uuid,
        entity: &EntityRef,
    ) -> Result<bool, WorkflowError> {
        retry_with_backoff(&self.retry, "entity_exists", || self.lookup(client_id, entity))
            .await
            .map_err(|e| WorkflowError::upstream(ENTITY_SERVICE, e.to_string()))
    }
}

#[async_trait]
impl ExpenseService for HttpEntityService {
    #[instrument(skip(self, draft), fields(transaction_id = %draft.transaction_id))]
    async fn create_expense(
        &self,
        client_id: Uuid,
        draft: ExpenseDraft,
    ) -> Result<Uuid, WorkflowError> {
        let upstream = |e: CallError| WorkflowError::upstream(ENTITY_SERVICE, e.to_string());

        let response = self
            .client
            .post(format!("{}/expenses", self.base_url))
            .headers(outbound_headers())
            .json(&CreateExpenseRequest {
                client_id,
                draft: &draft,
            })
            .send()
            .await
            .map_err(|e| upstream(CallError::Connection(e.to_string())))?;

        if !response.status().is_success() {
            return Err(upstream(read_error(response).await));
        }

        let created: CreatedExpense = response
            .json()
            .await
            .map_err(|e| upstream(CallError::Decode(e.to_string())))?;
        Ok(created.expense_id)
    }
}
