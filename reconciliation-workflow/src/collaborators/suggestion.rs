//! Local suggestion engine scoring registered invoices/expenses against a
//! bank line by amount, date proximity and payment reference.

use crate::collaborators::{Candidate, InMemoryEntities, LedgerEntity, SuggestionEngine};
use crate::error::WorkflowError;
use crate::models::BankTransaction;
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use uuid::Uuid;

pub struct AmountSuggestionEngine {
    entities: Arc<InMemoryEntities>,
    date_range_days: i64,
    min_likelihood: f64,
    limit: usize,
}

impl AmountSuggestionEngine {
    pub fn new(entities: Arc<InMemoryEntities>) -> Self {
        Self {
            entities,
            date_range_days: 14,
            min_likelihood: 0.5,
            limit: 5,
        }
    }

    /// Likelihood in 0..=1, or `None` when the entity cannot be this line.
    fn score(&self, transaction: &BankTransaction, entity: &LedgerEntity) -> Option<(f64, String)> {
        // Opposite directions never match
        if transaction.amount.is_sign_negative() != entity.amount.is_sign_negative() {
            return None;
        }

        let amount_diff = (transaction.amount - entity.amount).abs();
        let max_amount = transaction.amount.abs().max(entity.amount.abs());
        let amount_score = if max_amount.is_zero() {
            1.0
        } else {
            let ratio = (amount_diff / max_amount).to_f64().unwrap_or(1.0);
            (1.0 - ratio).max(0.0)
        };

        let days_diff = (transaction.booking_date - entity.date).num_days().abs();
        let date_score =
            (1.0 - days_diff as f64 / (self.date_range_days as f64 * 2.0)).max(0.0);

        // Weighted: 70% amount, 30% date
        let mut likelihood = amount_score * 0.7 + date_score * 0.3;
        let mut reasons = vec![if amount_diff.is_zero() {
            "amount matches exactly".to_string()
        } else {
            format!("amount differs by {}", amount_diff)
        }];
        reasons.push(format!("{} day(s) apart", days_diff));

        if let Some(reference) = entity.reference.as_deref().filter(|r| !r.is_empty()) {
            let needle = reference.to_lowercase();
            let mentioned = transaction.matches_query(&needle);
            if mentioned {
                likelihood = (likelihood + 0.15).min(1.0);
                reasons.push(format!("reference {} found", reference));
            }
        }

        (likelihood >= self.min_likelihood).then(|| (likelihood, reasons.join(", ")))
    }
}

#[async_trait]
impl SuggestionEngine for AmountSuggestionEngine {
    async fn suggest(
        &self,
        client_id: Uuid,
        transaction: &BankTransaction,
    ) -> Result<Vec<Candidate>, WorkflowError> {
        let mut candidates: Vec<Candidate> = self
            .entities
            .entities(client_id)
            .iter()
            .filter(|entity| entity.source_transaction_id.is_none())
            .filter_map(|entity| {
                self.score(transaction, entity).map(|(likelihood, reason)| Candidate {
                    entity: entity.entity.clone(),
                    confidence: (likelihood * 100.0).round().clamp(0.0, 100.0) as u8,
                    reason,
                })
            })
            .collect();

        // Stable sort keeps registration order on ties
        candidates.sort_by(|a, b| b.confidence.cmp(&a.confidence));
        candidates.truncate(self.limit);

        Ok(candidates)
    }
}
