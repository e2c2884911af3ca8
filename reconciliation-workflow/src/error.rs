//! Failure taxonomy of the reconciliation workflow.

use crate::models::{EntityRef, ProposalStatus, TransactionStatus};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("Action not allowed in this state: {requested} is not permitted while the transaction is {from}")]
    InvalidTransition {
        from: TransactionStatus,
        requested: String,
    },

    #[error("This suggestion is no longer available: proposal {proposal_id} is {status}")]
    ProposalNotPending {
        proposal_id: Uuid,
        status: ProposalStatus,
    },

    #[error("This suggestion is no longer available: transaction {transaction_id} is already {status}")]
    TransactionAlreadyMatched {
        transaction_id: Uuid,
        status: TransactionStatus,
    },

    #[error("{entity} is already linked to transaction {transaction_id}; pick a different entity or unmatch that transaction first")]
    EntityAlreadyLinked {
        entity: EntityRef,
        transaction_id: Uuid,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{service} is unavailable: {message}")]
    UpstreamUnavailable { service: String, message: String },

    #[error("Incomplete action: {0}")]
    InvalidAction(String),

    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl WorkflowError {
    /// Stable machine-readable kind, used in API bodies and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::ProposalNotPending { .. } => "proposal_not_pending",
            Self::TransactionAlreadyMatched { .. } => "transaction_already_matched",
            Self::EntityAlreadyLinked { .. } => "entity_already_linked",
            Self::NotFound(_) => "not_found",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::InvalidAction(_) => "invalid_action",
            Self::InvalidProposal(_) => "invalid_proposal",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }

    pub fn transaction_not_found(transaction_id: Uuid) -> Self {
        Self::NotFound(format!("Transaction {}", transaction_id))
    }

    pub fn proposal_not_found(proposal_id: Uuid) -> Self {
        Self::NotFound(format!("Proposal {}", proposal_id))
    }

    pub fn upstream(service: &str, message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            service: service.to_string(),
            message: message.into(),
        }
    }

    pub fn invalid_transition(from: TransactionStatus, requested: impl Into<String>) -> Self {
        Self::InvalidTransition {
            from,
            requested: requested.into(),
        }
    }
}
