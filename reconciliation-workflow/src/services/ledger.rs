//! Proposal Ledger: match proposals per transaction and their lifecycle.

use crate::error::WorkflowError;
use crate::models::{EntityRef, MatchProposal, ProposalStatus, MAX_CONFIDENCE};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

pub const CLOSED_SUPERSEDED: &str = "superseded";
pub const CLOSED_IGNORED: &str = "transaction ignored";
pub const CLOSED_BY_USER: &str = "rejected by user";

#[derive(Debug, Default)]
pub struct ProposalLedger {
    proposals: HashMap<Uuid, MatchProposal>,
    /// Proposal ids per transaction, in creation order.
    by_transaction: HashMap<Uuid, Vec<Uuid>>,
    next_seq: u64,
}

impl ProposalLedger {
    pub fn get(&self, proposal_id: Uuid) -> Result<&MatchProposal, WorkflowError> {
        self.proposals
            .get(&proposal_id)
            .ok_or_else(|| WorkflowError::proposal_not_found(proposal_id))
    }

    /// Every proposal ever recorded for the transaction, in creation order.
    pub fn list_for_transaction(&self, transaction_id: Uuid) -> Vec<&MatchProposal> {
        self.by_transaction
            .get(&transaction_id)
            .map(|ids| ids.iter().filter_map(|id| self.proposals.get(id)).collect())
            .unwrap_or_default()
    }

    /// Pending proposals, highest confidence first, earliest first on ties.
    pub fn list_pending(&self, transaction_id: Uuid) -> Vec<MatchProposal> {
        let mut pending: Vec<MatchProposal> = self
            .list_for_transaction(transaction_id)
            .into_iter()
            .filter(|p| p.status == ProposalStatus::Pending)
            .cloned()
            .collect();

        pending.sort_by(|a, b| {
            b.confidence
                .cmp(&a.confidence)
                .then(a.created_seq.cmp(&b.created_seq))
        });
        pending
    }

    pub fn has_pending(&self, transaction_id: Uuid) -> bool {
        self.list_for_transaction(transaction_id)
            .iter()
            .any(|p| p.status == ProposalStatus::Pending)
    }

    pub fn has_pending_for(&self, transaction_id: Uuid, candidate: &EntityRef) -> bool {
        self.list_for_transaction(transaction_id)
            .iter()
            .any(|p| p.status == ProposalStatus::Pending && &p.candidate == candidate)
    }

    pub(crate) fn create(
        &mut self,
        client_id: Uuid,
        transaction_id: Uuid,
        candidate: EntityRef,
        confidence: u8,
        reason: String,
        created_utc: DateTime<Utc>,
    ) -> Result<&MatchProposal, WorkflowError> {
        if confidence > MAX_CONFIDENCE {
            return Err(WorkflowError::InvalidProposal(format!(
                "confidence {} is outside 0..={}",
                confidence, MAX_CONFIDENCE
            )));
        }
        if candidate.entity_id.trim().is_empty() {
            return Err(WorkflowError::InvalidProposal(
                "candidate reference is empty".to_string(),
            ));
        }

        let proposal_id = Uuid::new_v4();
        let created_seq = self.next_seq;
        self.next_seq += 1;

        self.by_transaction
            .entry(transaction_id)
            .or_default()
            .push(proposal_id);

        let proposal = self.proposals.entry(proposal_id).or_insert(MatchProposal {
            proposal_id,
            transaction_id,
            client_id,
            candidate,
            confidence,
            reason,
            status: ProposalStatus::Pending,
            created_seq,
            created_utc,
            closed_reason: None,
        });
        Ok(&*proposal)
    }

    /// PENDING -> ACCEPTED. Accepted proposals are never touched again.
    pub(crate) fn mark_accepted(&mut self, proposal_id: Uuid) -> Result<(), WorkflowError> {
        let proposal = self
            .proposals
            .get_mut(&proposal_id)
            .ok_or_else(|| WorkflowError::proposal_not_found(proposal_id))?;

        if proposal.status != ProposalStatus::Pending {
            return Err(WorkflowError::ProposalNotPending {
                proposal_id,
                status: proposal.status,
            });
        }

        proposal.status = ProposalStatus::Accepted;
        Ok(())
    }

    /// PENDING -> REJECTED. Returns `false` when it was already rejected.
    pub(crate) fn reject(
        &mut self,
        proposal_id: Uuid,
        reason: &str,
    ) -> Result<bool, WorkflowError> {
        let proposal = self
            .proposals
            .get_mut(&proposal_id)
            .ok_or_else(|| WorkflowError::proposal_not_found(proposal_id))?;

        match proposal.status {
            ProposalStatus::Pending => {
                proposal.status = ProposalStatus::Rejected;
                proposal.closed_reason = Some(reason.to_string());
                Ok(true)
            }
            ProposalStatus::Rejected => Ok(false),
            ProposalStatus::Accepted => Err(WorkflowError::ProposalNotPending {
                proposal_id,
                status: proposal.status,
            }),
        }
    }

    /// Reject every pending proposal of the transaction; returns how many
    /// were closed.
    pub(crate) fn close_pending(&mut self, transaction_id: Uuid, reason: &str) -> usize {
        let Some(ids) = self.by_transaction.get(&transaction_id) else {
            return 0;
        };

        let mut closed = 0;
        for id in ids {
            if let Some(proposal) = self.proposals.get_mut(id) {
                if proposal.status == ProposalStatus::Pending {
                    proposal.status = ProposalStatus::Rejected;
                    proposal.closed_reason = Some(reason.to_string());
                    closed += 1;
                }
            }
        }
        closed
    }
}
