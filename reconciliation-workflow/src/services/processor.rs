//! Action Processor: validates user actions and applies them to the books.
//!
//! Every mutation of a client's books goes through here. Actions on one
//! transaction are serialized by a per-transaction mutex held for the whole
//! action, including collaborator calls; the books write lock is only held
//! for the final state change so reads never wait on a remote service.

use crate::collaborators::{Candidate, EntityDirectory, ExpenseDraft, ExpenseService, ImportedRow};
use crate::error::WorkflowError;
use crate::models::{
    ActionKind, ActionResult, ActionType, EntityRef, LinkOrigin, ReconciliationAction,
    TransactionStatus,
};
use crate::services::books::{BooksRegistry, ClientBooks};
use crate::services::ledger::CLOSED_BY_USER;
use crate::services::metrics::{
    record_action, record_error, record_proposal_decision, record_proposals_created,
};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// VAT rates accepted on a manually created expense.
pub const DUTCH_VAT_RATES: [u8; 3] = [0, 9, 21];
pub const MAX_NOTES_LEN: usize = 1000;
pub const DEFAULT_IDEMPOTENCY_RETENTION: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
struct RecordedAction {
    transaction_id: Uuid,
    action_type: ActionType,
    result: ActionResult,
    recorded_at: Instant,
}

/// Results of successfully applied actions, keyed by (client, action id).
#[derive(Debug)]
pub struct IdempotencyCache {
    entries: DashMap<(Uuid, Uuid), RecordedAction>,
    retention: Duration,
}

impl IdempotencyCache {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            retention,
        }
    }

    fn lookup(&self, client_id: Uuid, action_id: Uuid) -> Option<RecordedAction> {
        let entry = self.entries.get(&(client_id, action_id))?;
        (entry.recorded_at.elapsed() <= self.retention).then(|| entry.value().clone())
    }

    fn record(&self, client_id: Uuid, action_id: Uuid, recorded: RecordedAction) {
        let retention = self.retention;
        self.entries
            .retain(|_, entry| entry.recorded_at.elapsed() <= retention);
        self.entries.insert((client_id, action_id), recorded);
    }
}

/// Structural checks that need no state.
pub fn validate_action(kind: &ActionKind) -> Result<(), WorkflowError> {
    match kind {
        ActionKind::ApplyMatch { target } => match target {
            Some(target) if !target.entity_id.trim().is_empty() => Ok(()),
            _ => Err(WorkflowError::InvalidAction(
                "APPLY_MATCH requires a target entity reference".to_string(),
            )),
        },
        ActionKind::CreateExpense {
            vat_rate, notes, ..
        } => {
            if let Some(rate) = vat_rate {
                if !DUTCH_VAT_RATES.contains(rate) {
                    return Err(WorkflowError::InvalidAction(format!(
                        "VAT rate {}% is not one of 0, 9 or 21",
                        rate
                    )));
                }
            }
            if notes
                .as_deref()
                .map_or(false, |n| n.chars().count() > MAX_NOTES_LEN)
            {
                return Err(WorkflowError::InvalidAction(format!(
                    "notes are limited to {} characters",
                    MAX_NOTES_LEN
                )));
            }
            Ok(())
        }
        ActionKind::Ignore { .. } | ActionKind::Unmatch => Ok(()),
    }
}

fn ensure_allowed(
    from: TransactionStatus,
    to: TransactionStatus,
    action_type: ActionType,
) -> Result<(), WorkflowError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(WorkflowError::invalid_transition(from, action_type.as_str()))
    }
}

fn applied(transaction_id: Uuid, status: TransactionStatus, message: String) -> ActionResult {
    ActionResult {
        transaction_id,
        status,
        message,
        created_entity_id: None,
        replayed: false,
    }
}

/// A transaction's action mutex. The map entry is dropped with the last
/// holder so the map only tracks transactions with actions in flight.
struct TransactionLock<'a> {
    locks: &'a DashMap<Uuid, Arc<Mutex<()>>>,
    transaction_id: Uuid,
    lock: Arc<Mutex<()>>,
}

impl Drop for TransactionLock<'_> {
    fn drop(&mut self) {
        // The map and this holder are the only references when nobody waits
        self.locks
            .remove_if(&self.transaction_id, |_, lock| Arc::strong_count(lock) == 2);
    }
}

pub struct ActionProcessor {
    registry: Arc<BooksRegistry>,
    entities: Arc<dyn EntityDirectory>,
    expenses: Arc<dyn ExpenseService>,
    idempotency: IdempotencyCache,
    transaction_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl ActionProcessor {
    pub fn new(
        registry: Arc<BooksRegistry>,
        entities: Arc<dyn EntityDirectory>,
        expenses: Arc<dyn ExpenseService>,
        idempotency_retention: Duration,
    ) -> Self {
        Self {
            registry,
            entities,
            expenses,
            idempotency: IdempotencyCache::new(idempotency_retention),
            transaction_locks: DashMap::new(),
        }
    }

    fn transaction_lock(&self, transaction_id: Uuid) -> TransactionLock<'_> {
        let lock = self
            .transaction_locks
            .entry(transaction_id)
            .or_default()
            .clone();
        TransactionLock {
            locks: &self.transaction_locks,
            transaction_id,
            lock,
        }
    }

    /// Apply a user action to one transaction.
    #[instrument(
        skip(self, action),
        fields(client_id = %client_id, transaction_id = %transaction_id, action_type = %action.action_type())
    )]
    pub async fn apply(
        &self,
        client_id: Uuid,
        transaction_id: Uuid,
        action: ReconciliationAction,
    ) -> Result<ActionResult, WorkflowError> {
        let action_type = action.action_type();
        let outcome = self.apply_serialized(client_id, transaction_id, action).await;

        match &outcome {
            Ok(result) if result.replayed => record_action(action_type.as_str(), "replayed"),
            Ok(_) => record_action(action_type.as_str(), "applied"),
            Err(e) => {
                warn!(error = %e, kind = e.kind(), "Action refused");
                record_action(action_type.as_str(), e.kind());
                record_error(e.kind());
            }
        }

        outcome
    }

    async fn apply_serialized(
        &self,
        client_id: Uuid,
        transaction_id: Uuid,
        action: ReconciliationAction,
    ) -> Result<ActionResult, WorkflowError> {
        validate_action(&action.kind)?;

        let books = self.registry.books(client_id);
        books.read().await.transactions().get(transaction_id)?;

        let lock = self.transaction_lock(transaction_id);
        let _serialized = lock.lock.lock().await;

        let action_type = action.action_type();
        let ReconciliationAction { action_id, kind } = action;

        if let Some(action_id) = action_id {
            if let Some(recorded) = self.idempotency.lookup(client_id, action_id) {
                if recorded.transaction_id != transaction_id || recorded.action_type != action_type
                {
                    return Err(WorkflowError::InvalidAction(format!(
                        "action id {} was already used for a different action",
                        action_id
                    )));
                }
                debug!(action_id = %action_id, "Replaying recorded result");
                return Ok(ActionResult {
                    replayed: true,
                    ..recorded.result
                });
            }
        }

        let result = match kind {
            ActionKind::ApplyMatch { target } => {
                let target = target.ok_or_else(|| {
                    WorkflowError::InvalidAction("APPLY_MATCH requires a target".to_string())
                })?;
                self.apply_match(client_id, &books, transaction_id, target)
                    .await?
            }
            ActionKind::Ignore { reason } => self.ignore(&books, transaction_id, reason).await?,
            ActionKind::CreateExpense {
                category,
                vat_rate,
                notes,
            } => {
                self.create_expense(client_id, &books, transaction_id, category, vat_rate, notes)
                    .await?
            }
            ActionKind::Unmatch => self.unmatch(&books, transaction_id).await?,
        };

        if let Some(action_id) = action_id {
            self.idempotency.record(
                client_id,
                action_id,
                RecordedAction {
                    transaction_id,
                    action_type,
                    result: result.clone(),
                    recorded_at: Instant::now(),
                },
            );
        }

        Ok(result)
    }

    async fn apply_match(
        &self,
        client_id: Uuid,
        books: &RwLock<ClientBooks>,
        transaction_id: Uuid,
        target: EntityRef,
    ) -> Result<ActionResult, WorkflowError> {
        {
            let books = books.read().await;
            let transaction = books.transactions().get(transaction_id)?;
            if let Some(link) = transaction.link.as_ref().filter(|l| l.entity == target) {
                return Ok(applied(
                    transaction_id,
                    transaction.status,
                    format!("Already matched to {}", link.entity),
                ));
            }
            ensure_allowed(
                transaction.status,
                TransactionStatus::Matched,
                ActionType::ApplyMatch,
            )?;
            books.ensure_linkable(transaction_id, &target)?;
        }

        if !self.entities.entity_exists(client_id, &target).await? {
            return Err(WorkflowError::NotFound(target.to_string()));
        }

        let mut books = books.write().await;
        let now = Utc::now();
        let proposal_id = books
            .proposals()
            .list_pending(transaction_id)
            .into_iter()
            .find(|p| p.candidate == target)
            .map(|p| p.proposal_id);

        // Matching a suggested entity by hand counts as accepting the suggestion
        match proposal_id {
            Some(proposal_id) => {
                books.accept_proposal(proposal_id, now)?;
            }
            None => {
                books.link(transaction_id, target.clone(), LinkOrigin::Manual, now)?;
            }
        }

        info!(entity = %target, "Transaction matched");
        Ok(applied(
            transaction_id,
            TransactionStatus::Matched,
            format!("Matched to {}", target),
        ))
    }

    async fn ignore(
        &self,
        books: &RwLock<ClientBooks>,
        transaction_id: Uuid,
        reason: Option<String>,
    ) -> Result<ActionResult, WorkflowError> {
        let mut books = books.write().await;
        let status = books.transactions().get(transaction_id)?.status;

        if status == TransactionStatus::Ignored {
            return Ok(applied(
                transaction_id,
                status,
                "Transaction was already ignored".to_string(),
            ));
        }
        ensure_allowed(status, TransactionStatus::Ignored, ActionType::Ignore)?;

        let closed = books.ignore(transaction_id)?;
        info!(
            closed_proposals = closed,
            reason = reason.as_deref().unwrap_or_default(),
            "Transaction ignored"
        );
        Ok(applied(
            transaction_id,
            TransactionStatus::Ignored,
            "Transaction ignored".to_string(),
        ))
    }

    async fn create_expense(
        &self,
        client_id: Uuid,
        books: &RwLock<ClientBooks>,
        transaction_id: Uuid,
        category: Option<String>,
        vat_rate: Option<u8>,
        notes: Option<String>,
    ) -> Result<ActionResult, WorkflowError> {
        let draft = {
            let books = books.read().await;
            let transaction = books.transactions().get(transaction_id)?;
            ensure_allowed(
                transaction.status,
                TransactionStatus::Matched,
                ActionType::CreateExpense,
            )?;
            ExpenseDraft {
                transaction_id,
                booking_date: transaction.booking_date,
                amount: transaction.amount.abs(),
                description: transaction.description.clone(),
                counterparty_name: transaction.counterparty_name.clone(),
                category,
                vat_rate,
                notes,
            }
        };

        let expense_id = self.expenses.create_expense(client_id, draft).await?;
        let entity = EntityRef::expense(expense_id);

        let mut books = books.write().await;
        if let Err(e) = books.link(
            transaction_id,
            entity.clone(),
            LinkOrigin::CreatedExpense,
            Utc::now(),
        ) {
            warn!(expense_id = %expense_id, error = %e, "Expense created but not linked");
            return Err(e);
        }

        info!(expense_id = %expense_id, "Expense created and matched");
        Ok(ActionResult {
            created_entity_id: Some(expense_id.to_string()),
            ..applied(
                transaction_id,
                TransactionStatus::Matched,
                format!("Created and matched {}", entity),
            )
        })
    }

    async fn unmatch(
        &self,
        books: &RwLock<ClientBooks>,
        transaction_id: Uuid,
    ) -> Result<ActionResult, WorkflowError> {
        let mut books = books.write().await;
        let status = books.transactions().get(transaction_id)?.status;
        ensure_allowed(status, TransactionStatus::New, ActionType::Unmatch)?;

        let message = match books.unlink(transaction_id)? {
            Some(link) => {
                info!(entity = %link.entity, "Match removed");
                format!("Match with {} removed", link.entity)
            }
            None => "Transaction restored".to_string(),
        };
        Ok(applied(transaction_id, TransactionStatus::New, message))
    }

    #[instrument(skip(self), fields(client_id = %client_id, proposal_id = %proposal_id))]
    pub async fn accept_proposal(
        &self,
        client_id: Uuid,
        proposal_id: Uuid,
    ) -> Result<ActionResult, WorkflowError> {
        let outcome = self.accept_serialized(client_id, proposal_id).await;
        self.record_decision("accept", &outcome);
        outcome
    }

    async fn accept_serialized(
        &self,
        client_id: Uuid,
        proposal_id: Uuid,
    ) -> Result<ActionResult, WorkflowError> {
        let books = self.registry.books(client_id);
        let transaction_id = books.read().await.proposals().get(proposal_id)?.transaction_id;

        let lock = self.transaction_lock(transaction_id);
        let _serialized = lock.lock.lock().await;

        let mut books = books.write().await;
        let proposal = books.accept_proposal(proposal_id, Utc::now())?;

        info!(entity = %proposal.candidate, confidence = proposal.confidence, "Proposal accepted");
        Ok(applied(
            transaction_id,
            TransactionStatus::Matched,
            format!("Matched to {}", proposal.candidate),
        ))
    }

    /// Rejecting an already rejected proposal succeeds without change.
    #[instrument(skip(self), fields(client_id = %client_id, proposal_id = %proposal_id))]
    pub async fn reject_proposal(
        &self,
        client_id: Uuid,
        proposal_id: Uuid,
    ) -> Result<ActionResult, WorkflowError> {
        let outcome = self.reject_serialized(client_id, proposal_id).await;
        self.record_decision("reject", &outcome);
        outcome
    }

    async fn reject_serialized(
        &self,
        client_id: Uuid,
        proposal_id: Uuid,
    ) -> Result<ActionResult, WorkflowError> {
        let books = self.registry.books(client_id);
        let transaction_id = books.read().await.proposals().get(proposal_id)?.transaction_id;

        let lock = self.transaction_lock(transaction_id);
        let _serialized = lock.lock.lock().await;

        let mut books = books.write().await;
        let changed = books.proposals.reject(proposal_id, CLOSED_BY_USER)?;
        let status = books.transactions().get(transaction_id)?.status;

        let message = if changed {
            "Suggestion rejected"
        } else {
            "Suggestion was already rejected"
        };
        Ok(applied(transaction_id, status, message.to_string()))
    }

    fn record_decision(&self, decision: &str, outcome: &Result<ActionResult, WorkflowError>) {
        match outcome {
            Ok(_) => record_proposal_decision(decision, "applied"),
            Err(e) => {
                warn!(error = %e, kind = e.kind(), decision, "Proposal decision refused");
                record_proposal_decision(decision, e.kind());
                record_error(e.kind());
            }
        }
    }

    /// Record engine suggestions. Transactions that are no longer open or
    /// already have pending proposals are skipped, as are candidates already
    /// linked to a transaction. Returns the number of proposals created.
    #[instrument(skip(self, suggestions), fields(client_id = %client_id, transactions = suggestions.len()))]
    pub async fn record_proposals(
        &self,
        client_id: Uuid,
        suggestions: Vec<(Uuid, Vec<Candidate>)>,
    ) -> Result<usize, WorkflowError> {
        let books = self.registry.books(client_id);
        let mut books = books.write().await;
        let now = Utc::now();
        let mut created = 0;

        for (transaction_id, candidates) in suggestions {
            let status = match books.transactions().get(transaction_id) {
                Ok(transaction) => transaction.status,
                Err(_) => continue,
            };
            if !status.is_open() || books.proposals().has_pending(transaction_id) {
                debug!(transaction_id = %transaction_id, status = %status, "Skipping suggestions");
                continue;
            }

            let mut created_here = 0;
            for candidate in candidates {
                if books.linked_transaction(&candidate.entity).is_some()
                    || books
                        .proposals()
                        .has_pending_for(transaction_id, &candidate.entity)
                {
                    continue;
                }
                match books.proposals.create(
                    client_id,
                    transaction_id,
                    candidate.entity,
                    candidate.confidence,
                    candidate.reason,
                    now,
                ) {
                    Ok(_) => created_here += 1,
                    Err(e) => warn!(transaction_id = %transaction_id, error = %e, "Discarding candidate"),
                }
            }

            if created_here > 0 && status == TransactionStatus::New {
                books
                    .transactions
                    .set_status(transaction_id, TransactionStatus::NeedsReview)?;
            }
            created += created_here;
        }

        record_proposals_created("suggestion_engine", created);
        Ok(created)
    }

    /// Store freshly imported statement lines as NEW transactions.
    pub async fn record_imported(&self, client_id: Uuid, rows: Vec<ImportedRow>) -> Vec<Uuid> {
        let books = self.registry.get_or_create(client_id);
        let mut books = books.write().await;
        books
            .transactions
            .insert_imported(client_id, rows, Utc::now())
    }
}
