//! Transaction Store: authoritative state of a client's imported bank lines.
//!
//! Financial fields are fixed at import. Only the status and the match link
//! change afterwards, and only through the crate-private mutators, which the
//! action processor drives.

use crate::collaborators::ImportedRow;
use crate::error::WorkflowError;
use crate::models::{BankTransaction, MatchLink, PageRequest, TransactionFilter, TransactionStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct TransactionStore {
    transactions: HashMap<Uuid, BankTransaction>,
    /// Import order.
    order: Vec<Uuid>,
}

impl TransactionStore {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, transaction_id: Uuid) -> Result<&BankTransaction, WorkflowError> {
        self.transactions
            .get(&transaction_id)
            .ok_or_else(|| WorkflowError::transaction_not_found(transaction_id))
    }

    /// Transactions in import order.
    pub fn iter(&self) -> impl Iterator<Item = &BankTransaction> {
        self.order
            .iter()
            .filter_map(|transaction_id| self.transactions.get(transaction_id))
    }

    /// Filtered page, newest booking date first; same-day lines keep import
    /// order. Returns the page items and the total number of matches.
    pub fn list(
        &self,
        filter: &TransactionFilter,
        page: PageRequest,
    ) -> (Vec<BankTransaction>, usize) {
        let needle = filter
            .query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase);

        let mut matching: Vec<&BankTransaction> = self
            .iter()
            .filter(|t| filter.status.map_or(true, |status| t.status == status))
            .filter(|t| needle.as_deref().map_or(true, |n| t.matches_query(n)))
            .collect();

        // Stable sort keeps import order for equal dates
        matching.sort_by(|a, b| b.booking_date.cmp(&a.booking_date));

        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(page.offset())
            .take(page.page_size as usize)
            .cloned()
            .collect();

        (items, total)
    }

    pub(crate) fn insert_imported(
        &mut self,
        client_id: Uuid,
        rows: Vec<ImportedRow>,
        imported_utc: DateTime<Utc>,
    ) -> Vec<Uuid> {
        rows.into_iter()
            .map(|row| {
                let transaction_id = Uuid::new_v4();
                self.transactions.insert(
                    transaction_id,
                    BankTransaction {
                        transaction_id,
                        client_id,
                        booking_date: row.booking_date,
                        amount: row.amount,
                        description: row.description,
                        counterparty_name: row.counterparty_name,
                        counterparty_iban: row.counterparty_iban,
                        reference: row.reference,
                        account_iban: row.account_iban,
                        status: TransactionStatus::New,
                        link: None,
                        imported_utc,
                    },
                );
                self.order.push(transaction_id);
                transaction_id
            })
            .collect()
    }

    /// Move along an edge of the transition table; returns the previous
    /// status.
    pub(crate) fn set_status(
        &mut self,
        transaction_id: Uuid,
        new_status: TransactionStatus,
    ) -> Result<TransactionStatus, WorkflowError> {
        let transaction = self
            .transactions
            .get_mut(&transaction_id)
            .ok_or_else(|| WorkflowError::transaction_not_found(transaction_id))?;

        let previous = transaction.status;
        if !previous.can_transition_to(new_status) {
            return Err(WorkflowError::invalid_transition(
                previous,
                new_status.as_str(),
            ));
        }

        transaction.status = new_status;
        Ok(previous)
    }

    pub(crate) fn set_link(
        &mut self,
        transaction_id: Uuid,
        link: Option<MatchLink>,
    ) -> Result<Option<MatchLink>, WorkflowError> {
        let transaction = self
            .transactions
            .get_mut(&transaction_id)
            .ok_or_else(|| WorkflowError::transaction_not_found(transaction_id))?;

        Ok(std::mem::replace(&mut transaction.link, link))
    }
}
