//! Services module for reconciliation-workflow.

pub mod books;
pub mod ledger;
pub mod metrics;
pub mod processor;
pub mod store;
pub mod workflow;

pub use books::{BooksRegistry, ClientBooks};
pub use ledger::ProposalLedger;
pub use metrics::{get_metrics, init_metrics, record_error, record_http_request};
pub use processor::ActionProcessor;
pub use store::TransactionStore;
pub use workflow::{ReconciliationWorkflow, WorkflowSettings};
