//! Workflow facade: the operations the presentation layer calls.

use crate::collaborators::{Collaborators, ImportFile};
use crate::error::WorkflowError;
use crate::models::{
    ActionResult, BankTransaction, GenerateOutcome, ImportSummary, Kpi, MatchProposal,
    PageRequest, ProposalStatus, ReconciliationAction, TransactionFilter, TransactionPage,
    TransactionStatus,
};
use crate::services::books::BooksRegistry;
use crate::services::metrics::{record_error, record_statement_import};
use crate::services::processor::{ActionProcessor, DEFAULT_IDEMPOTENCY_RETENTION};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub const KPI_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub default_page_size: u32,
    pub max_page_size: u32,
    pub idempotency_retention: Duration,
    /// Suggestion engine calls in flight at once during generation.
    pub suggestion_concurrency: usize,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            default_page_size: 50,
            max_page_size: 200,
            idempotency_retention: DEFAULT_IDEMPOTENCY_RETENTION,
            suggestion_concurrency: 8,
        }
    }
}

pub struct ReconciliationWorkflow {
    registry: Arc<BooksRegistry>,
    processor: ActionProcessor,
    collaborators: Collaborators,
    settings: WorkflowSettings,
}

impl ReconciliationWorkflow {
    pub fn new(collaborators: Collaborators, settings: WorkflowSettings) -> Self {
        let registry = Arc::new(BooksRegistry::new());
        let processor = ActionProcessor::new(
            registry.clone(),
            collaborators.entities.clone(),
            collaborators.expenses.clone(),
            settings.idempotency_retention,
        );

        Self {
            registry,
            processor,
            collaborators,
            settings,
        }
    }

    pub fn processor(&self) -> &ActionProcessor {
        &self.processor
    }

    fn normalize_page(&self, page: PageRequest) -> Result<PageRequest, WorkflowError> {
        if page.page == 0 {
            return Err(WorkflowError::InvalidRequest(
                "page numbers start at 1".to_string(),
            ));
        }
        let page_size = match page.page_size {
            0 => self.settings.default_page_size,
            size => size.min(self.settings.max_page_size),
        };
        Ok(PageRequest::new(page.page, page_size))
    }

    #[instrument(skip(self, filter), fields(client_id = %client_id, page = page.page))]
    pub async fn list_transactions(
        &self,
        client_id: Uuid,
        filter: TransactionFilter,
        page: PageRequest,
    ) -> Result<TransactionPage, WorkflowError> {
        let page = self.normalize_page(page)?;
        let books = self.registry.books(client_id);
        let books = books.read().await;
        let (items, total_count) = books.transactions().list(&filter, page);

        Ok(TransactionPage {
            items,
            total_count,
            page: page.page,
            page_size: page.page_size,
        })
    }

    pub async fn get_transaction(
        &self,
        client_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<BankTransaction, WorkflowError> {
        let books = self.registry.books(client_id);
        let books = books.read().await;
        books.transactions().get(transaction_id).cloned()
    }

    /// Pending proposals in presentation order, followed by closed ones in
    /// creation order.
    pub async fn list_proposals(
        &self,
        client_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Vec<MatchProposal>, WorkflowError> {
        let books = self.registry.books(client_id);
        let books = books.read().await;
        books.transactions().get(transaction_id)?;

        let mut proposals = books.proposals().list_pending(transaction_id);
        proposals.extend(
            books
                .proposals()
                .list_for_transaction(transaction_id)
                .into_iter()
                .filter(|p| p.status != ProposalStatus::Pending)
                .cloned(),
        );
        Ok(proposals)
    }

    /// Ask the suggestion engine about every open transaction without a
    /// pending proposal and record what comes back. Engine calls run without
    /// holding the books lock; transactions that moved on meanwhile are
    /// skipped when recording.
    #[instrument(skip(self), fields(client_id = %client_id))]
    pub async fn generate_proposals(&self, client_id: Uuid) -> Result<GenerateOutcome, WorkflowError> {
        let snapshot: Vec<BankTransaction> = {
            let books = self.registry.books(client_id);
            let books = books.read().await;
            books
                .transactions()
                .iter()
                .filter(|t| t.status.is_open() && !books.proposals().has_pending(t.transaction_id))
                .cloned()
                .collect()
        };

        if snapshot.is_empty() {
            return Ok(GenerateOutcome {
                created_count: 0,
                message: "No open transactions need suggestions".to_string(),
            });
        }

        let engine = self.collaborators.suggestions.clone();
        let responses: Vec<_> = stream::iter(snapshot)
            .map(|transaction| {
                let engine = engine.clone();
                async move {
                    let candidates = engine.suggest(client_id, &transaction).await;
                    (transaction.transaction_id, candidates)
                }
            })
            .buffer_unordered(self.settings.suggestion_concurrency.max(1))
            .collect()
            .await;

        let asked = responses.len();
        let mut suggestions = Vec::with_capacity(asked);
        let mut last_error = None;
        for (transaction_id, outcome) in responses {
            match outcome {
                Ok(candidates) => suggestions.push((transaction_id, candidates)),
                Err(e) => {
                    warn!(transaction_id = %transaction_id, error = %e, "Suggestion request failed");
                    record_error(e.kind());
                    last_error = Some(e);
                }
            }
        }

        // Nothing to record when the engine failed for every transaction
        if suggestions.is_empty() {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        let failed = asked - suggestions.len();
        let created_count = self.processor.record_proposals(client_id, suggestions).await?;

        let mut message = format!(
            "Created {} proposal(s) for {} open transaction(s)",
            created_count, asked
        );
        if failed > 0 {
            message.push_str(&format!("; {} could not be scored", failed));
        }
        info!(created_count, failed, "Proposals generated");

        Ok(GenerateOutcome {
            created_count,
            message,
        })
    }

    pub async fn compute_kpi(&self, client_id: Uuid) -> Result<Kpi, WorkflowError> {
        self.compute_kpi_as_of(client_id, Utc::now().date_naive())
            .await
    }

    /// `matched_percentage_30d` covers non-ignored transactions booked in the
    /// 30 days ending at `as_of`; the other figures cover all transactions.
    pub async fn compute_kpi_as_of(
        &self,
        client_id: Uuid,
        as_of: NaiveDate,
    ) -> Result<Kpi, WorkflowError> {
        let window_start = as_of
            .checked_sub_signed(ChronoDuration::days(KPI_WINDOW_DAYS))
            .ok_or_else(|| {
                WorkflowError::InvalidRequest(format!("as_of {} is out of range", as_of))
            })?;
        let books = self.registry.books(client_id);
        let books = books.read().await;

        let mut in_window = 0usize;
        let mut matched_in_window = 0usize;
        let mut unmatched_count = 0usize;
        let mut total_inflow = Decimal::ZERO;
        let mut total_outflow = Decimal::ZERO;

        for transaction in books.transactions().iter() {
            if transaction.status.is_open() {
                unmatched_count += 1;
            }
            if transaction.amount.is_sign_positive() {
                total_inflow += transaction.amount;
            } else {
                total_outflow += transaction.amount.abs();
            }

            let booked_in_window =
                transaction.booking_date > window_start && transaction.booking_date <= as_of;
            if booked_in_window && transaction.status != TransactionStatus::Ignored {
                in_window += 1;
                if transaction.status == TransactionStatus::Matched {
                    matched_in_window += 1;
                }
            }
        }

        let matched_percentage_30d = if in_window == 0 {
            0.0
        } else {
            let percentage = matched_in_window as f64 * 100.0 / in_window as f64;
            (percentage * 10.0).round() / 10.0
        };

        Ok(Kpi {
            matched_percentage_30d,
            unmatched_count,
            total_inflow,
            total_outflow,
        })
    }

    pub async fn apply_action(
        &self,
        client_id: Uuid,
        transaction_id: Uuid,
        action: ReconciliationAction,
    ) -> Result<ActionResult, WorkflowError> {
        self.processor.apply(client_id, transaction_id, action).await
    }

    pub async fn accept_proposal(
        &self,
        client_id: Uuid,
        proposal_id: Uuid,
    ) -> Result<ActionResult, WorkflowError> {
        self.processor.accept_proposal(client_id, proposal_id).await
    }

    pub async fn reject_proposal(
        &self,
        client_id: Uuid,
        proposal_id: Uuid,
    ) -> Result<ActionResult, WorkflowError> {
        self.processor.reject_proposal(client_id, proposal_id).await
    }

    #[instrument(skip(self, file), fields(client_id = %client_id, file_name = %file.file_name))]
    pub async fn import_file(
        &self,
        client_id: Uuid,
        file: ImportFile,
        iban_hint: Option<String>,
        bank_name_hint: Option<String>,
    ) -> Result<ImportSummary, WorkflowError> {
        let report = match self
            .collaborators
            .importer
            .import_file(client_id, file, iban_hint, bank_name_hint)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                record_statement_import("failed", 0, 0, 0);
                record_error(e.kind());
                return Err(e);
            }
        };

        let imported = self.processor.record_imported(client_id, report.rows).await;
        record_statement_import(
            "completed",
            imported.len(),
            report.skipped_duplicates_count,
            report.errors.len(),
        );

        let mut message = format!(
            "Imported {} transaction(s), skipped {} duplicate(s)",
            imported.len(),
            report.skipped_duplicates_count
        );
        if !report.errors.is_empty() {
            message.push_str(&format!(", {} line(s) rejected", report.errors.len()));
        }
        info!(
            imported = imported.len(),
            skipped = report.skipped_duplicates_count,
            rejected = report.errors.len(),
            "Statement imported"
        );

        Ok(ImportSummary {
            imported_count: imported.len(),
            skipped_duplicates_count: report.skipped_duplicates_count,
            errors: report
                .errors
                .iter()
                .map(|e| format!("line {}: {}", e.line, e.message))
                .collect(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{Candidate, InMemoryEntities, SuggestionEngine};
    use crate::models::EntityRef;
    use async_trait::async_trait;

    fn workflow() -> (ReconciliationWorkflow, Arc<InMemoryEntities>) {
        let entities = Arc::new(InMemoryEntities::new());
        let workflow = ReconciliationWorkflow::new(
            Collaborators::in_process(entities.clone()),
            WorkflowSettings::default(),
        );
        (workflow, entities)
    }

    fn csv(lines: &[&str]) -> ImportFile {
        let mut content = String::from("date;amount;description;counterparty;iban;reference\n");
        for line in lines {
            content.push_str(line);
            content.push('\n');
        }
        ImportFile {
            file_name: "statement.csv".to_string(),
            content: content.into_bytes(),
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    struct DownEngine;

    #[async_trait]
    impl SuggestionEngine for DownEngine {
        async fn suggest(
            &self,
            _client_id: Uuid,
            _transaction: &BankTransaction,
        ) -> Result<Vec<Candidate>, WorkflowError> {
            Err(WorkflowError::upstream("suggestion engine", "timed out"))
        }
    }

    #[tokio::test]
    async fn page_zero_is_rejected_and_size_is_clamped() {
        let (workflow, _) = workflow();
        let client = Uuid::new_v4();

        let err = workflow
            .list_transactions(client, TransactionFilter::default(), PageRequest::new(0, 10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_request");

        let page = workflow
            .list_transactions(client, TransactionFilter::default(), PageRequest::new(1, 5000))
            .await
            .unwrap();
        assert_eq!(page.page_size, 200);

        let page = workflow
            .list_transactions(client, TransactionFilter::default(), PageRequest::new(1, 0))
            .await
            .unwrap();
        assert_eq!(page.page_size, 50);
    }

    #[tokio::test]
    async fn kpi_counts_window_and_totals() {
        let (workflow, _) = workflow();
        let client = Uuid::new_v4();
        workflow
            .import_file(
                client,
                csv(&[
                    "2024-06-01;-100,00;a;;;",
                    "2024-06-02;250,00;b;;;",
                    "2024-06-03;-50,00;c;;;",
                    "2024-06-04;-10,00;d;;;",
                    "2024-03-01;-999,00;old;;;",
                ]),
                None,
                None,
            )
            .await
            .unwrap();

        let page = workflow
            .list_transactions(client, TransactionFilter::default(), PageRequest::new(1, 50))
            .await
            .unwrap();
        let by_description = |d: &str| {
            page.items
                .iter()
                .find(|t| t.description == d)
                .unwrap()
                .transaction_id
        };

        workflow
            .apply_action(client, by_description("a"), ReconciliationAction::create_expense("bank", 0))
            .await
            .unwrap();
        workflow
            .apply_action(client, by_description("d"), ReconciliationAction::ignore())
            .await
            .unwrap();

        let kpi = workflow
            .compute_kpi_as_of(client, date(2024, 6, 10))
            .await
            .unwrap();

        // a matched, b and c open, d ignored; "old" is outside the window
        assert_eq!(kpi.matched_percentage_30d, 33.3);
        assert_eq!(kpi.unmatched_count, 3);
        assert_eq!(kpi.total_inflow, Decimal::new(25000, 2));
        assert_eq!(kpi.total_outflow, Decimal::new(115900, 2));
    }

    #[tokio::test]
    async fn kpi_of_empty_books_is_zero() {
        let (workflow, _) = workflow();
        let kpi = workflow.compute_kpi(Uuid::new_v4()).await.unwrap();
        assert_eq!(kpi.matched_percentage_30d, 0.0);
        assert_eq!(kpi.unmatched_count, 0);
        assert_eq!(kpi.total_inflow, Decimal::ZERO);
    }

    #[tokio::test]
    async fn kpi_rejects_dates_without_a_full_window() {
        let (workflow, _) = workflow();
        let err = workflow
            .compute_kpi_as_of(Uuid::new_v4(), NaiveDate::MIN)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_request");

        let kpi = workflow
            .compute_kpi_as_of(Uuid::new_v4(), NaiveDate::MAX)
            .await
            .unwrap();
        assert_eq!(kpi.unmatched_count, 0);
    }

    #[tokio::test]
    async fn reads_for_unknown_clients_leave_the_registry_empty() {
        let (workflow, _) = workflow();
        for _ in 0..100 {
            let client = Uuid::new_v4();
            workflow
                .list_transactions(client, TransactionFilter::default(), PageRequest::new(1, 10))
                .await
                .unwrap();
            workflow.compute_kpi(client).await.unwrap();
            workflow.generate_proposals(client).await.unwrap();
            assert_eq!(
                workflow.get_transaction(client, Uuid::new_v4()).await.unwrap_err().kind(),
                "not_found"
            );
        }
        assert!(workflow.registry.clients.is_empty());
    }

    #[tokio::test]
    async fn generate_skips_transactions_with_pending_proposals() {
        let (workflow, entities) = workflow();
        let client = Uuid::new_v4();
        entities.register_invoice(client, "2024-017", Decimal::new(60500, 2), date(2024, 6, 8));
        workflow
            .import_file(
                client,
                csv(&["2024-06-10;605,00;Betaling factuur 2024-017;Klant BV;;2024-017"]),
                None,
                None,
            )
            .await
            .unwrap();

        let first = workflow.generate_proposals(client).await.unwrap();
        assert_eq!(first.created_count, 1);
        let second = workflow.generate_proposals(client).await.unwrap();
        assert_eq!(second.created_count, 0);

        let page = workflow
            .list_transactions(
                client,
                TransactionFilter {
                    status: Some(TransactionStatus::NeedsReview),
                    query: None,
                },
                PageRequest::new(1, 50),
            )
            .await
            .unwrap();
        assert_eq!(page.total_count, 1);

        let proposals = workflow
            .list_proposals(client, page.items[0].transaction_id)
            .await
            .unwrap();
        assert_eq!(proposals[0].candidate, EntityRef::invoice("2024-017"));
    }

    #[tokio::test]
    async fn generate_surfaces_engine_outage() {
        let entities = Arc::new(InMemoryEntities::new());
        let collaborators = Collaborators {
            suggestions: Arc::new(DownEngine),
            ..Collaborators::in_process(entities)
        };
        let workflow = ReconciliationWorkflow::new(collaborators, WorkflowSettings::default());
        let client = Uuid::new_v4();
        workflow
            .import_file(client, csv(&["2024-06-10;-5,00;koffie;;;"]), None, None)
            .await
            .unwrap();

        let err = workflow.generate_proposals(client).await.unwrap_err();
        assert_eq!(err.kind(), "upstream_unavailable");

        let page = workflow
            .list_transactions(client, TransactionFilter::default(), PageRequest::new(1, 50))
            .await
            .unwrap();
        assert_eq!(page.items[0].status, TransactionStatus::New);
    }

    #[tokio::test]
    async fn import_reports_rejected_lines() {
        let (workflow, _) = workflow();
        let summary = workflow
            .import_file(
                Uuid::new_v4(),
                csv(&["2024-06-10;-5,00;koffie;;;", "gisteren;-5,00;thee;;;"]),
                Some("NL02RABO0123456789".to_string()),
                Some("Rabobank".to_string()),
            )
            .await
            .unwrap();

        assert_eq!(summary.imported_count, 1);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].starts_with("line 3:"));
    }
}
