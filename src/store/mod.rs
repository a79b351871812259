//! Ledger Store Adapter
//!
//! Narrow read/write contract over the persistent datastore. Every
//! balance mutation goes through an atomic primitive (`post_transaction`,
//! `reserve_withdrawal`, `resolve_withdrawal`) that serializes per user
//! and enforces idempotency-key uniqueness together with the insert.

mod error;
mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::{
    AccountBalance, LedgerTransaction, PurchaseOrder, ReferralCode, ReferralLink, TransactionType,
    WithdrawalRequest,
};

pub use error::StoreError;
pub use memory::InMemoryLedgerStore;
pub use postgres::PgLedgerStore;

/// A credit to be posted against an account
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub user_id: Uuid,
    pub kind: TransactionType,
    /// Positive and already rounded to 8 fractional digits
    pub amount: Decimal,
    pub reference_id: String,
    pub idempotency_key: String,
}

/// Result of an atomic posting
#[derive(Debug, Clone, PartialEq)]
pub enum PostOutcome {
    /// The transaction was inserted and the balance updated
    Applied(LedgerTransaction),
    /// A transaction with the same idempotency key already existed; nothing changed
    Duplicate(LedgerTransaction),
}

impl PostOutcome {
    pub fn transaction(&self) -> &LedgerTransaction {
        match self {
            PostOutcome::Applied(tx) | PostOutcome::Duplicate(tx) => tx,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, PostOutcome::Applied(_))
    }
}

/// Terminal transition requested by the payout process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WithdrawalResolution {
    Complete,
    Reject { reason: String },
}

/// A withdrawal after its terminal transition
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedWithdrawal {
    pub withdrawal: WithdrawalRequest,
    /// WITHDRAWAL transaction written on completion
    pub transaction: Option<LedgerTransaction>,
}

/// Persistent state consumed by the ledger engines
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // Accounts and transactions

    async fn open_account(&self, user_id: Uuid) -> Result<AccountBalance, StoreError>;

    async fn get_account(&self, user_id: Uuid) -> Result<Option<AccountBalance>, StoreError>;

    async fn find_transaction_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<LedgerTransaction>, StoreError>;

    /// Newest first
    async fn list_transactions(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<LedgerTransaction>, StoreError>;

    /// Atomically read the balance under a per-user lock, apply the credit,
    /// and insert the transaction row. A unique violation on the
    /// idempotency key yields `PostOutcome::Duplicate` with the stored row.
    ///
    /// A PURCHASE row also claims its order: a second PURCHASE under
    /// another key for the same `reference_id` fails with
    /// `OrderAlreadySettled`, and a PENDING order with that reference turns
    /// COMPLETED in the same step.
    async fn post_transaction(&self, tx: NewTransaction) -> Result<PostOutcome, StoreError>;

    // Purchase orders

    async fn create_order(&self, order: PurchaseOrder) -> Result<(), StoreError>;

    async fn get_order(&self, reference_id: &str) -> Result<Option<PurchaseOrder>, StoreError>;

    /// PENDING -> COMPLETED. Succeeds again for the settling transaction,
    /// fails with `OrderAlreadySettled` for any other.
    async fn complete_order(&self, reference_id: &str, transaction_id: Uuid)
        -> Result<(), StoreError>;

    // Referrals

    /// Case-insensitive lookup
    async fn find_referral_code(&self, code: &str) -> Result<Option<ReferralCode>, StoreError>;

    async fn find_referral_code_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Option<ReferralCode>, StoreError>;

    async fn insert_referral_code(&self, code: ReferralCode) -> Result<(), StoreError>;

    async fn find_referral_by_referee(
        &self,
        referee_id: Uuid,
    ) -> Result<Option<ReferralLink>, StoreError>;

    async fn list_referrals_by_referrer(
        &self,
        referrer_id: Uuid,
    ) -> Result<Vec<ReferralLink>, StoreError>;

    /// Fails with `DuplicateReferee` when the referee already has a link and
    /// with `ReferralLimitReached` when the referrer already holds
    /// `max_per_referrer` links. Both checks run atomically with the insert.
    async fn insert_referral(
        &self,
        link: ReferralLink,
        max_per_referrer: usize,
    ) -> Result<(), StoreError>;

    /// Flip `first_purchase_bonus_granted` from false to true. Returns
    /// `false` when it was already set.
    async fn mark_first_purchase_bonus(
        &self,
        referral_id: Uuid,
        referrer_bonus: Decimal,
        referee_bonus: Decimal,
    ) -> Result<bool, StoreError>;

    // Withdrawals

    /// Atomically check `available >= kaus_amount`, add the amount to
    /// `pending_kaus` and insert the PENDING request.
    async fn reserve_withdrawal(
        &self,
        request: WithdrawalRequest,
    ) -> Result<WithdrawalRequest, StoreError>;

    async fn get_withdrawal(&self, id: Uuid) -> Result<Option<WithdrawalRequest>, StoreError>;

    /// PENDING -> COMPLETED (debit + WITHDRAWAL row) or PENDING -> REJECTED
    /// (release the reservation)
    async fn resolve_withdrawal(
        &self,
        id: Uuid,
        resolution: WithdrawalResolution,
    ) -> Result<ResolvedWithdrawal, StoreError>;

    async fn list_pending_withdrawals_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WithdrawalRequest>, StoreError>;
}

/// Idempotency key of the WITHDRAWAL row written when a withdrawal settles
pub fn withdrawal_settlement_key(withdrawal_id: Uuid) -> String {
    format!("WD-SETTLE-{}", withdrawal_id)
}
