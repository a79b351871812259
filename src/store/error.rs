//! Ledger Store Errors

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::LedgerError;

/// Errors that can occur in the ledger store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Store cannot be reached (timeouts, injected failures)
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Account not found: {0}")]
    AccountNotFound(Uuid),

    #[error("Account already exists: {0}")]
    AccountExists(Uuid),

    #[error("Referee already linked: {0}")]
    DuplicateReferee(Uuid),

    #[error("Referral code already exists: {0}")]
    DuplicateReferralCode(String),

    #[error("Order already exists: {0}")]
    DuplicateOrder(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// Another payment already settled this order reference
    #[error("Order already settled: {0}")]
    OrderAlreadySettled(String),

    /// The referrer's code has reached its link limit
    #[error("Referral limit reached for {0}")]
    ReferralLimitReached(Uuid),

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: Decimal, available: Decimal },

    #[error("Withdrawal not found: {0}")]
    WithdrawalNotFound(Uuid),

    #[error("Withdrawal {id} is {status}")]
    InvalidWithdrawalState { id: Uuid, status: String },

    /// A stored row could not be decoded
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Check if this error is transient
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Unavailable(_))
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AccountNotFound(id) => LedgerError::UserNotFound(id),
            StoreError::AccountExists(id) => LedgerError::AccountExists(id),
            StoreError::DuplicateReferee(id) => LedgerError::AlreadyClaimed(id),
            StoreError::OrderNotFound(reference) => LedgerError::OrderNotFound(reference),
            StoreError::OrderAlreadySettled(reference_id) => LedgerError::PaymentMismatch {
                reference_id,
                reason: "order already settled by another payment".to_string(),
            },
            StoreError::ReferralLimitReached(referrer) => {
                LedgerError::ReferralLimitReached(referrer)
            }
            StoreError::InsufficientBalance { required, available } => {
                LedgerError::InsufficientBalance { required, available }
            }
            StoreError::WithdrawalNotFound(id) => LedgerError::WithdrawalNotFound(id),
            StoreError::InvalidWithdrawalState { id, status } => {
                LedgerError::InvalidWithdrawalState { id, status }
            }
            other => LedgerError::StoreUnavailable(other.to_string()),
        }
    }
}
