//! Ledger Error Types
//!
//! Domain errors shared by the settlement, referral and withdrawal
//! engines. They don't depend on the web layer.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use super::amount::AmountError;
use super::currency::Currency;

/// Error classes callers act on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, never retried automatically
    Validation,
    /// Unknown user, code, order or withdrawal
    NotFound,
    /// Transient infrastructure failure, safe to retry with the same key
    StoreUnavailable,
    /// Part of a multi-leg operation already took effect
    ReconciliationRequired,
}

/// Errors returned by the ledger engines
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(#[from] AmountError),

    #[error("Minimum withdrawal: {min} {currency}")]
    BelowMinimum { min: Decimal, currency: Currency },

    #[error("Maximum withdrawal: {max} {currency}")]
    AboveMaximum { max: Decimal, currency: Currency },

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: Decimal, available: Decimal },

    #[error("Unknown package: {0}")]
    UnknownPackage(String),

    #[error("Invalid referral code: {0}")]
    InvalidReferralCode(String),

    #[error("Cannot refer yourself")]
    SelfReferral,

    #[error("Referral bonus already claimed by {0}")]
    AlreadyClaimed(Uuid),

    #[error("Referrer {0} reached the referral limit")]
    ReferralLimitReached(Uuid),

    #[error("Invalid idempotency key: {0}")]
    InvalidIdempotencyKey(String),

    #[error("Idempotency key {key} was used with different parameters")]
    IdempotencyConflict { key: String },

    #[error("Payment does not match order {reference_id}: {reason}")]
    PaymentMismatch { reference_id: String, reason: String },

    #[error("Invalid withdrawal destination: {0}")]
    InvalidDestination(String),

    #[error("Withdrawal {id} is {status}, expected PENDING")]
    InvalidWithdrawalState { id: Uuid, status: String },

    #[error("Account already exists: {0}")]
    AccountExists(Uuid),

    #[error("User not found: {0}")]
    UserNotFound(Uuid),

    #[error("Referral code not found: {0}")]
    ReferralCodeNotFound(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Withdrawal not found: {0}")]
    WithdrawalNotFound(Uuid),

    #[error("No referral found for user {0}")]
    ReferralNotFound(Uuid),

    #[error("Ledger store unavailable: {0}")]
    StoreUnavailable(String),

    /// Part of the operation is already persisted. `applied` lists the ids
    /// of records that exist and must not be re-applied blindly.
    #[error("Reconciliation required for {operation}: {detail}")]
    ReconciliationRequired {
        operation: String,
        detail: String,
        applied: Vec<Uuid>,
    },
}

impl LedgerError {
    pub fn reconciliation(
        operation: impl Into<String>,
        detail: impl Into<String>,
        applied: Vec<Uuid>,
    ) -> Self {
        Self::ReconciliationRequired {
            operation: operation.into(),
            detail: detail.into(),
            applied,
        }
    }

    pub fn insufficient_balance(required: Decimal, available: Decimal) -> Self {
        Self::InsufficientBalance { required, available }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UserNotFound(_)
            | Self::ReferralCodeNotFound(_)
            | Self::OrderNotFound(_)
            | Self::WithdrawalNotFound(_)
            | Self::ReferralNotFound(_) => ErrorKind::NotFound,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::ReconciliationRequired { .. } => ErrorKind::ReconciliationRequired,
            _ => ErrorKind::Validation,
        }
    }

    /// Only transient store failures are retried, always with the same key
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::StoreUnavailable
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAmount(_) => "INVALID_AMOUNT",
            Self::BelowMinimum { .. } => "BELOW_MINIMUM",
            Self::AboveMaximum { .. } => "ABOVE_MAXIMUM",
            Self::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            Self::UnknownPackage(_) => "UNKNOWN_PACKAGE",
            Self::InvalidReferralCode(_) => "INVALID_REFERRAL_CODE",
            Self::SelfReferral => "SELF_REFERRAL",
            Self::AlreadyClaimed(_) => "ALREADY_CLAIMED",
            Self::ReferralLimitReached(_) => "REFERRAL_LIMIT_REACHED",
            Self::InvalidIdempotencyKey(_) => "INVALID_IDEMPOTENCY_KEY",
            Self::IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",
            Self::PaymentMismatch { .. } => "PAYMENT_MISMATCH",
            Self::InvalidDestination(_) => "INVALID_DESTINATION",
            Self::InvalidWithdrawalState { .. } => "INVALID_WITHDRAWAL_STATE",
            Self::AccountExists(_) => "ACCOUNT_EXISTS",
            Self::UserNotFound(_) => "USER_NOT_FOUND",
            Self::ReferralCodeNotFound(_) => "REFERRAL_CODE_NOT_FOUND",
            Self::OrderNotFound(_) => "ORDER_NOT_FOUND",
            Self::WithdrawalNotFound(_) => "WITHDRAWAL_NOT_FOUND",
            Self::ReferralNotFound(_) => "REFERRAL_NOT_FOUND",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::ReconciliationRequired { .. } => "RECONCILIATION_REQUIRED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_insufficient_balance_error() {
        let err = LedgerError::insufficient_balance(dec!(100), dec!(50));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("100"));
        assert!(err.to_string().contains("50"));
    }

    #[test]
    fn test_not_found_kind() {
        assert_eq!(LedgerError::UserNotFound(Uuid::nil()).kind(), ErrorKind::NotFound);
        assert_eq!(
            LedgerError::ReferralCodeNotFound("F9-X".to_string()).code(),
            "REFERRAL_CODE_NOT_FOUND"
        );
    }

    #[test]
    fn test_store_unavailable_is_retryable() {
        let err = LedgerError::StoreUnavailable("connection reset".to_string());
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    }

    #[test]
    fn test_reconciliation_is_not_retryable() {
        let err = LedgerError::reconciliation("claim_signup_bonus", "referee leg failed", vec![Uuid::nil()]);
        assert_eq!(err.kind(), ErrorKind::ReconciliationRequired);
        assert!(!err.is_retryable());
        assert_eq!(err.code(), "RECONCILIATION_REQUIRED");
    }
}
