//! Per-client books: transaction store, proposal ledger and the entity link
//! index, kept behind one lock so every composite change is atomic.

use crate::error::WorkflowError;
use crate::models::{EntityRef, LinkOrigin, MatchLink, MatchProposal, ProposalStatus, TransactionStatus};
use crate::services::ledger::{ProposalLedger, CLOSED_IGNORED, CLOSED_SUPERSEDED};
use crate::services::store::TransactionStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct ClientBooks {
    pub(crate) transactions: TransactionStore,
    pub(crate) proposals: ProposalLedger,
    /// Entity -> the one transaction it reconciles.
    links: HashMap<EntityRef, Uuid>,
}

impl ClientBooks {
    pub fn transactions(&self) -> &TransactionStore {
        &self.transactions
    }

    pub fn proposals(&self) -> &ProposalLedger {
        &self.proposals
    }

    pub fn linked_transaction(&self, entity: &EntityRef) -> Option<Uuid> {
        self.links.get(entity).copied()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Fails with `EntityAlreadyLinked` when the entity reconciles another
    /// transaction.
    pub fn ensure_linkable(
        &self,
        transaction_id: Uuid,
        entity: &EntityRef,
    ) -> Result<(), WorkflowError> {
        match self.linked_transaction(entity) {
            Some(other) if other != transaction_id => Err(WorkflowError::EntityAlreadyLinked {
                entity: entity.clone(),
                transaction_id: other,
            }),
            _ => Ok(()),
        }
    }

    /// Reconcile an open transaction against `entity` and close whatever
    /// proposals are still pending for it.
    pub(crate) fn link(
        &mut self,
        transaction_id: Uuid,
        entity: EntityRef,
        origin: LinkOrigin,
        now: DateTime<Utc>,
    ) -> Result<usize, WorkflowError> {
        self.ensure_linkable(transaction_id, &entity)?;
        self.transactions
            .set_status(transaction_id, TransactionStatus::Matched)?;

        self.links.insert(entity.clone(), transaction_id);
        self.transactions.set_link(
            transaction_id,
            Some(MatchLink {
                entity,
                origin,
                linked_utc: now,
            }),
        )?;

        Ok(self
            .proposals
            .close_pending(transaction_id, CLOSED_SUPERSEDED))
    }

    /// Accept a pending proposal: the proposal becomes ACCEPTED, the
    /// transaction MATCHED, and its sibling proposals REJECTED.
    pub(crate) fn accept_proposal(
        &mut self,
        proposal_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<MatchProposal, WorkflowError> {
        let proposal = self.proposals.get(proposal_id)?.clone();
        if proposal.status != ProposalStatus::Pending {
            return Err(WorkflowError::ProposalNotPending {
                proposal_id,
                status: proposal.status,
            });
        }

        let transaction = self.transactions.get(proposal.transaction_id)?;
        if !transaction.status.is_open() {
            return Err(WorkflowError::TransactionAlreadyMatched {
                transaction_id: transaction.transaction_id,
                status: transaction.status,
            });
        }
        self.ensure_linkable(proposal.transaction_id, &proposal.candidate)?;

        self.proposals.mark_accepted(proposal_id)?;
        self.link(
            proposal.transaction_id,
            proposal.candidate.clone(),
            LinkOrigin::Proposal { proposal_id },
            now,
        )?;

        Ok(self.proposals.get(proposal_id)?.clone())
    }

    /// MATCHED -> NEW, detaching the link. The entity itself is untouched.
    pub(crate) fn unlink(&mut self, transaction_id: Uuid) -> Result<Option<MatchLink>, WorkflowError> {
        self.transactions
            .set_status(transaction_id, TransactionStatus::New)?;
        let link = self.transactions.set_link(transaction_id, None)?;
        if let Some(link) = &link {
            self.links.remove(&link.entity);
        }
        Ok(link)
    }

    pub(crate) fn ignore(&mut self, transaction_id: Uuid) -> Result<usize, WorkflowError> {
        self.transactions
            .set_status(transaction_id, TransactionStatus::Ignored)?;
        Ok(self.proposals.close_pending(transaction_id, CLOSED_IGNORED))
    }
}

/// All clients' books, one lock per client.
#[derive(Debug, Default)]
pub struct BooksRegistry {
    pub(super) clients: DashMap<Uuid, Arc<RwLock<ClientBooks>>>,
}

impl BooksRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Books of a client. An unknown client gets an empty book that is not
    /// registered, so lookups never allocate registry entries.
    pub fn books(&self, client_id: Uuid) -> Arc<RwLock<ClientBooks>> {
        self.clients
            .get(&client_id)
            .map(|books| books.value().clone())
            .unwrap_or_default()
    }

    /// Books of a client, registered on first use. Only imports open books.
    pub(crate) fn get_or_create(&self, client_id: Uuid) -> Arc<RwLock<ClientBooks>> {
        self.clients.entry(client_id).or_default().clone()
    }
}
