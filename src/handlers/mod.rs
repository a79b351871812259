//! Command Handlers module
//!
//! The ledger engines. Each handler validates a command, performs the
//! atomic store mutation and writes the matching audit record.

mod commands;
mod purchase_handler;
mod referral_handler;
mod settlement_handler;
mod withdrawal_handler;


use uuid::Uuid;

use crate::domain::LedgerError;

pub use commands::*;
pub use purchase_handler::{generate_reference_id, PurchaseHandler};
pub use referral_handler::{
    first_purchase_leg_key, is_valid_code, signup_leg_key, BonusKind, Leg, ReferralHandler,
};
pub use settlement_handler::SettlementHandler;
pub use withdrawal_handler::WithdrawalHandler;

/// Build a `ReconciliationRequired` error and raise the operator alert.
///
/// `applied` holds the ids of records already persisted by the failed
/// operation.
pub(crate) fn reconciliation_required(
    operation: &str,
    detail: String,
    applied: Vec<Uuid>,
) -> LedgerError {
    tracing::error!(
        alert = "reconciliation_required",
        operation = operation,
        applied = ?applied,
        "{}",
        detail
    );
    LedgerError::reconciliation(operation, detail, applied)
}
