//! KAUS Ledger Library
//!
//! Re-exports modules for integration testing and external use.

pub mod api;
pub mod audit;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod idempotency;
pub mod jobs;
pub mod rate_limit;
pub mod store;

pub use api::AppState;
pub use config::Config;
pub use domain::{Amount, AmountError, LedgerError, OperationContext};
pub use error::{AppError, AppResult};
