//! Reconciliation Workflow - bank transaction reconciliation: match proposals,
//! user actions with undo, and KPIs.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod http;
pub mod models;
pub mod services;
pub mod startup;

pub use error::WorkflowError;
