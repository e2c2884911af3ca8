//! Domain models for reconciliation-workflow.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Transaction Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    New,
    NeedsReview,
    Matched,
    Ignored,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 4] = [
        Self::New,
        Self::NeedsReview,
        Self::Matched,
        Self::Ignored,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::NeedsReview => "NEEDS_REVIEW",
            Self::Matched => "MATCHED",
            Self::Ignored => "IGNORED",
        }
    }

    /// Case-insensitive parse, as used for query parameters.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Still awaiting a disposition.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::New | Self::NeedsReview)
    }

    /// The transition table. Re-entry from MATCHED or IGNORED always goes
    /// through NEW.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (New, NeedsReview)
                | (New | NeedsReview, Matched)
                | (New | NeedsReview, Ignored)
                | (Matched, New)
                | (Ignored, New)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inflow,
    Outflow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankTransaction {
    pub transaction_id: Uuid,
    pub client_id: Uuid,
    pub booking_date: NaiveDate,
    pub amount: Decimal,
    pub description: String,
    pub counterparty_name: Option<String>,
    pub counterparty_iban: Option<String>,
    pub reference: Option<String>,
    pub account_iban: Option<String>,
    pub status: TransactionStatus,
    pub link: Option<MatchLink>,
    pub imported_utc: DateTime<Utc>,
}

impl BankTransaction {
    /// Zero amounts count as inflow.
    pub fn direction(&self) -> Direction {
        if self.amount.is_sign_negative() && !self.amount.is_zero() {
            Direction::Outflow
        } else {
            Direction::Inflow
        }
    }

    /// `needle` must already be lowercase.
    pub fn matches_query(&self, needle: &str) -> bool {
        let hit = |field: Option<&str>| {
            field
                .map(|value| value.to_lowercase().contains(needle))
                .unwrap_or(false)
        };

        hit(Some(&self.description))
            || hit(self.counterparty_name.as_deref())
            || hit(self.counterparty_iban.as_deref())
            || hit(self.reference.as_deref())
    }
}

// ============================================================================
// Ledger Entity References
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Invoice,
    Expense,
    Transfer,
    Manual,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invoice => "invoice",
            Self::Expense => "expense",
            Self::Transfer => "transfer",
            Self::Manual => "manual",
        }
    }
}

/// A ledger entity a bank line can be reconciled against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }

    pub fn invoice(entity_id: impl Into<String>) -> Self {
        Self::new(EntityType::Invoice, entity_id)
    }

    pub fn expense(expense_id: Uuid) -> Self {
        Self::new(EntityType::Expense, expense_id.to_string())
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.entity_type.as_str(), self.entity_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkOrigin {
    Proposal { proposal_id: Uuid },
    Manual,
    CreatedExpense,
}

/// The single entity a MATCHED transaction is reconciled against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchLink {
    pub entity: EntityRef,
    pub origin: LinkOrigin,
    pub linked_utc: DateTime<Utc>,
}

// ============================================================================
// Proposal Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Accepted => "ACCEPTED",
            Self::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const MAX_CONFIDENCE: u8 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchProposal {
    pub proposal_id: Uuid,
    pub transaction_id: Uuid,
    pub client_id: Uuid,
    pub candidate: EntityRef,
    pub confidence: u8,
    pub reason: String,
    pub status: ProposalStatus,
    /// Creation order within the ledger, used as the ranking tie-break.
    pub created_seq: u64,
    pub created_utc: DateTime<Utc>,
    pub closed_reason: Option<String>,
}

// ============================================================================
// Action Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    ApplyMatch,
    Ignore,
    CreateExpense,
    Unmatch,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApplyMatch => "APPLY_MATCH",
            Self::Ignore => "IGNORE",
            Self::CreateExpense => "CREATE_EXPENSE",
            Self::Unmatch => "UNMATCH",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    ApplyMatch {
        #[serde(default)]
        target: Option<EntityRef>,
    },
    Ignore {
        #[serde(default)]
        reason: Option<String>,
    },
    CreateExpense {
        #[serde(default)]
        category: Option<String>,
        #[serde(default)]
        vat_rate: Option<u8>,
        #[serde(default)]
        notes: Option<String>,
    },
    Unmatch,
}

impl ActionKind {
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::ApplyMatch { .. } => ActionType::ApplyMatch,
            Self::Ignore { .. } => ActionType::Ignore,
            Self::CreateExpense { .. } => ActionType::CreateExpense,
            Self::Unmatch => ActionType::Unmatch,
        }
    }
}

/// A user command against one bank transaction. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationAction {
    /// Resubmitting the same id within the retention window replays the
    /// recorded result instead of applying the action again.
    #[serde(default)]
    pub action_id: Option<Uuid>,
    #[serde(flatten)]
    pub kind: ActionKind,
}

impl ReconciliationAction {
    pub fn apply_match(target: EntityRef) -> Self {
        Self::from(ActionKind::ApplyMatch {
            target: Some(target),
        })
    }

    pub fn ignore() -> Self {
        Self::from(ActionKind::Ignore { reason: None })
    }

    pub fn create_expense(category: impl Into<String>, vat_rate: u8) -> Self {
        Self::from(ActionKind::CreateExpense {
            category: Some(category.into()),
            vat_rate: Some(vat_rate),
            notes: None,
        })
    }

    pub fn unmatch() -> Self {
        Self::from(ActionKind::Unmatch)
    }

    pub fn with_id(mut self, action_id: Uuid) -> Self {
        self.action_id = Some(action_id);
        self
    }

    pub fn action_type(&self) -> ActionType {
        self.kind.action_type()
    }
}

impl From<ActionKind> for ReconciliationAction {
    fn from(kind: ActionKind) -> Self {
        Self {
            action_id: None,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub transaction_id: Uuid,
    pub status: TransactionStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_entity_id: Option<String>,
    /// True when served from the idempotency window without re-applying.
    pub replayed: bool,
}

// ============================================================================
// Query and Report Models
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionFilter {
    pub status: Option<TransactionStatus>,
    pub query: Option<String>,
}

/// 1-indexed page request; a zero page size means "use the default".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self { page, page_size }
    }

    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.page_size as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionPage {
    pub items: Vec<BankTransaction>,
    pub total_count: usize,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateOutcome {
    pub created_count: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kpi {
    pub matched_percentage_30d: f64,
    pub unmatched_count: usize,
    pub total_inflow: Decimal,
    pub total_outflow: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub imported_count: usize,
    pub skipped_duplicates_count: usize,
    pub errors: Vec<String>,
    pub message: String,
}
