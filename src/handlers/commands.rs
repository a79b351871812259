//! Command definitions
//!
//! Validated inputs and results of the ledger engines. Commands are built
//! at the boundary; once constructed they are known to be well formed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    Amount, Currency, LedgerError, PaymentMethod, WithdrawalDestination, WithdrawalMethod,
    WithdrawalStatus,
};
use crate::idempotency::validate_key;

// =========================================================================
// Settlement
// =========================================================================

/// Credit a verified payment to a user's balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletePurchaseCommand {
    pub user_id: Uuid,
    /// Business order id (`KAUS-...` reference)
    pub order_id: String,
    pub total_amount: Amount,
    /// Provider payment id
    pub idempotency_key: String,
}

impl CompletePurchaseCommand {
    pub fn new(
        user_id: Uuid,
        order_id: impl Into<String>,
        total_amount: Amount,
        idempotency_key: impl Into<String>,
    ) -> Result<Self, LedgerError> {
        let idempotency_key = idempotency_key.into();
        validate_key(&idempotency_key)?;
        Ok(Self {
            user_id,
            order_id: order_id.into(),
            total_amount,
            idempotency_key,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReceipt {
    pub transaction_id: Uuid,
    pub new_balance: Decimal,
}

/// Result of `complete_purchase`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettlementOutcome {
    Settled(SettlementReceipt),
    /// The key was seen before; carries the originally recorded result
    AlreadyProcessed(SettlementReceipt),
}

impl SettlementOutcome {
    pub fn receipt(&self) -> SettlementReceipt {
        match self {
            SettlementOutcome::Settled(r) | SettlementOutcome::AlreadyProcessed(r) => *r,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, SettlementOutcome::AlreadyProcessed(_))
    }
}

// =========================================================================
// Purchases
// =========================================================================

/// Start a package purchase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitiatePurchaseCommand {
    pub user_id: Uuid,
    pub package_id: String,
    pub currency: Currency,
    pub payment_method: PaymentMethod,
}

/// Price quote returned for a new order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseQuote {
    pub reference_id: String,
    pub package_id: String,
    pub kaus_amount: Decimal,
    pub bonus_amount: Decimal,
    pub total_kaus: Decimal,
    pub price: Decimal,
    pub currency: Currency,
    pub payment_method: PaymentMethod,
}

/// Payment-confirmed event delivered by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentConfirmedEvent {
    pub provider: PaymentMethod,
    /// Capture id; the idempotency key of the settlement
    pub payment_id: String,
    pub reference_id: String,
    pub amount: Amount,
    pub currency: Currency,
    pub payer_email: Option<String>,
}

impl PaymentConfirmedEvent {
    pub fn new(
        provider: PaymentMethod,
        payment_id: impl Into<String>,
        reference_id: impl Into<String>,
        amount: Amount,
        currency: Currency,
    ) -> Result<Self, LedgerError> {
        let payment_id = payment_id.into();
        validate_key(&payment_id)?;
        let reference_id = reference_id.into();
        if reference_id.trim().is_empty() {
            return Err(LedgerError::OrderNotFound(reference_id));
        }
        Ok(Self {
            provider,
            payment_id,
            reference_id,
            amount,
            currency,
            payer_email: None,
        })
    }

    pub fn with_payer_email(mut self, email: impl Into<String>) -> Self {
        self.payer_email = Some(email.into());
        self
    }
}

/// What happened to the first-purchase referral bonus of a settled payment
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "status",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ReferralBonusStatus {
    Granted {
        referrer_bonus: Decimal,
        referee_bonus: Decimal,
    },
    AlreadyGranted,
    NotReferred,
    /// Not evaluated because the payment was a replay
    Skipped,
    /// The bonus failed after the payment settled; carries the error code
    Failed {
        code: String,
    },
}

/// Result of handling a payment-confirmed event
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentSettlement {
    pub reference_id: String,
    pub user_id: Uuid,
    pub outcome: SettlementOutcome,
    pub referral_bonus: ReferralBonusStatus,
}

// =========================================================================
// Referrals
// =========================================================================

/// Claim the signup bonus with a referral code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimSignupBonusCommand {
    pub referee_id: Uuid,
    /// Uppercased referral code
    pub referral_code: String,
}

impl ClaimSignupBonusCommand {
    pub fn new(referee_id: Uuid, referral_code: &str) -> Result<Self, LedgerError> {
        let referral_code = referral_code.trim().to_uppercase();
        if !super::referral_handler::is_valid_code(&referral_code) {
            return Err(LedgerError::InvalidReferralCode(referral_code));
        }
        Ok(Self {
            referee_id,
            referral_code,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupBonusResult {
    pub referral_id: Uuid,
    pub referrer_id: Uuid,
    pub referee_id: Uuid,
    pub referrer_bonus: Decimal,
    pub referee_bonus: Decimal,
    pub referrer_transaction_id: Uuid,
    pub referee_transaction_id: Uuid,
}

/// Grant the first-purchase bonus for a referee
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirstPurchaseBonusCommand {
    pub referee_id: Uuid,
    pub purchase_amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirstPurchaseBonusResult {
    pub referral_id: Uuid,
    pub referrer_id: Uuid,
    pub referee_id: Uuid,
    pub referrer_bonus: Decimal,
    pub referee_bonus: Decimal,
}

/// Result of `grant_first_purchase_bonus`
#[derive(Debug, Clone, PartialEq)]
pub enum FirstPurchaseOutcome {
    Granted(FirstPurchaseBonusResult),
    /// The flag was already set; nothing was credited
    AlreadyGranted,
    /// The referee has no referral link
    NotReferred,
}

/// Outcome of one bonus leg during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LegStatus {
    /// Posted by this call
    Applied,
    /// Already present; left untouched
    AlreadyApplied,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegReport {
    pub user_id: Uuid,
    pub idempotency_key: String,
    pub transaction_id: Uuid,
    pub status: LegStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub referral_id: Uuid,
    pub legs: Vec<LegReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralStats {
    pub code: Option<String>,
    pub total_referrals: usize,
    pub active_referrals: usize,
    pub referrals_with_purchase: usize,
    /// Percent of referrals that made a first purchase
    pub conversion_rate: Decimal,
    pub earned_kaus: Decimal,
    pub earned_krw: Decimal,
}

// =========================================================================
// Withdrawals
// =========================================================================

/// Request a payout of fiat against the KAUS balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalCommand {
    pub user_id: Uuid,
    /// Fiat amount
    pub amount: Amount,
    pub currency: Currency,
    pub method: WithdrawalMethod,
    pub destination: WithdrawalDestination,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalReceipt {
    pub withdrawal_id: Uuid,
    pub amount: Decimal,
    pub currency: Currency,
    pub fee: Decimal,
    pub net_amount: Decimal,
    pub kaus_amount: Decimal,
    pub status: WithdrawalStatus,
    pub estimated_arrival: DateTime<Utc>,
}
