//! Boundaries to the services the workflow consumes but does not own:
//! suggestion engine, statement import, and the invoice/expense books.

pub mod csv_import;
pub mod http;
pub mod in_memory;
pub mod suggestion;

use crate::error::WorkflowError;
use crate::models::{BankTransaction, EntityRef};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub use csv_import::CsvImportService;
pub use http::{HttpEntityService, HttpSuggestionEngine};
pub use in_memory::{InMemoryEntities, LedgerEntity};
pub use suggestion::AmountSuggestionEngine;

/// A ranked candidate returned by the suggestion engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub entity: EntityRef,
    pub confidence: u8,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ImportFile {
    pub file_name: String,
    pub content: Vec<u8>,
}

/// One parsed, non-duplicate statement line.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedRow {
    pub booking_date: NaiveDate,
    pub amount: Decimal,
    pub description: String,
    pub counterparty_name: Option<String>,
    pub counterparty_iban: Option<String>,
    pub reference: Option<String>,
    pub account_iban: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRowError {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportReport {
    pub imported_count: usize,
    pub skipped_duplicates_count: usize,
    pub errors: Vec<ImportRowError>,
    pub rows: Vec<ImportedRow>,
}

/// What the expense books need to record a manual expense for a bank line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseDraft {
    pub transaction_id: Uuid,
    pub booking_date: NaiveDate,
    pub amount: Decimal,
    pub description: String,
    pub counterparty_name: Option<String>,
    pub category: Option<String>,
    pub vat_rate: Option<u8>,
    pub notes: Option<String>,
}

#[async_trait]
pub trait SuggestionEngine: Send + Sync {
    async fn suggest(
        &self,
        client_id: Uuid,
        transaction: &BankTransaction,
    ) -> Result<Vec<Candidate>, WorkflowError>;
}

/// Parses a bank export and drops lines it has already seen for the client.
#[async_trait]
pub trait ImportService: Send + Sync {
    async fn import_file(
        &self,
        client_id: Uuid,
        file: ImportFile,
        iban_hint: Option<String>,
        bank_name_hint: Option<String>,
    ) -> Result<ImportReport, WorkflowError>;
}

#[async_trait]
pub trait ExpenseService: Send + Sync {
    async fn create_expense(
        &self,
        client_id: Uuid,
        draft: ExpenseDraft,
    ) -> Result<Uuid, WorkflowError>;
}

#[async_trait]
pub trait EntityDirectory: Send + Sync {
    async fn entity_exists(
        &self,
        client_id: Uuid,
        entity: &EntityRef,
    ) -> Result<bool, WorkflowError>;
}

/// The full set of collaborators a workflow runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub suggestions: Arc<dyn SuggestionEngine>,
    pub importer: Arc<dyn ImportService>,
    pub expenses: Arc<dyn ExpenseService>,
    pub entities: Arc<dyn EntityDirectory>,
}

impl Collaborators {
    /// Everything in-process, backed by one entity registry.
    pub fn in_process(entities: Arc<InMemoryEntities>) -> Self {
        Self {
            suggestions: Arc::new(AmountSuggestionEngine::new(entities.clone())),
            importer: Arc::new(CsvImportService::new()),
            expenses: entities.clone(),
            entities,
        }
    }
}
