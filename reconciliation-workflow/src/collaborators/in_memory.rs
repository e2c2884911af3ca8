//! In-process invoice/expense registry.

use crate::collaborators::{EntityDirectory, ExpenseDraft, ExpenseService};
use crate::error::WorkflowError;
use crate::models::{EntityRef, EntityType};
use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An invoice or expense as the bank would see it: `amount` is signed the
/// way the matching bank line is (sales invoices positive, costs negative).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntity {
    pub entity: EntityRef,
    pub amount: Decimal,
    pub date: NaiveDate,
    pub reference: Option<String>,
    pub description: String,
    pub category: Option<String>,
    pub vat_rate: Option<u8>,
    pub notes: Option<String>,
    pub source_transaction_id: Option<Uuid>,
}

#[derive(Debug, Default)]
pub struct InMemoryEntities {
    clients: DashMap<Uuid, Vec<LedgerEntity>>,
}

impl InMemoryEntities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client_id: Uuid, entity: LedgerEntity) {
        self.clients.entry(client_id).or_default().push(entity);
    }

    /// Register an invoice whose number doubles as its payment reference.
    pub fn register_invoice(
        &self,
        client_id: Uuid,
        number: &str,
        amount: Decimal,
        date: NaiveDate,
    ) -> EntityRef {
        let entity = EntityRef::invoice(number);
        self.register(
            client_id,
            LedgerEntity {
                entity: entity.clone(),
                amount,
                date,
                reference: Some(number.to_string()),
                description: format!("Factuur {}", number),
                category: None,
                vat_rate: None,
                notes: None,
                source_transaction_id: None,
            },
        );
        entity
    }

    pub fn entities(&self, client_id: Uuid) -> Vec<LedgerEntity> {
        self.clients
            .get(&client_id)
            .map(|entities| entities.clone())
            .unwrap_or_default()
    }

    pub fn find(&self, client_id: Uuid, entity: &EntityRef) -> Option<LedgerEntity> {
        self.clients
            .get(&client_id)
            .and_then(|entities| entities.iter().find(|e| &e.entity == entity).cloned())
    }

    pub fn expense_count(&self, client_id: Uuid) -> usize {
        self.clients
            .get(&client_id)
            .map(|entities| {
                entities
                    .iter()
                    .filter(|e| e.entity.entity_type == EntityType::Expense)
                    .count()
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl EntityDirectory for InMemoryEntities {
    async fn entity_exists(
        &self,
        client_id: Uuid,
        entity: &EntityRef,
    ) -> Result<bool, WorkflowError> {
        Ok(self.find(client_id, entity).is_some())
    }
}

#[async_trait]
impl ExpenseService for InMemoryEntities {
    async fn create_expense(
        &self,
        client_id: Uuid,
        draft: ExpenseDraft,
    ) -> Result<Uuid, WorkflowError> {
        let expense_id = Uuid::new_v4();
        self.register(
            client_id,
            LedgerEntity {
                entity: EntityRef::expense(expense_id),
                amount: -draft.amount.abs(),
                date: draft.booking_date,
                reference: None,
                description: draft.description,
                category: draft.category,
                vat_rate: draft.vat_rate,
                notes: draft.notes,
                source_transaction_id: Some(draft.transaction_id),
            },
        );
        tracing::debug!(client_id = %client_id, expense_id = %expense_id, "Expense recorded");
        Ok(expense_id)
    }
}
