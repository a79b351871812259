//! Ledger records
//!
//! Accounts, transactions, referral links, withdrawals and purchase orders
//! as persisted by the ledger store.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::currency::{Currency, WithdrawalMethod};
use super::precision::{add8, round8, sub8};

// =========================================================================
// Accounts
// =========================================================================

/// Per-user balance record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub user_id: Uuid,
    pub kaus_balance: Decimal,
    /// Earmarked for in-flight withdrawals, always <= kaus_balance
    pub pending_kaus: Decimal,
    pub total_earnings: Decimal,
    pub total_deposits: Decimal,
    pub total_withdrawals: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl AccountBalance {
    /// A fresh, empty account
    pub fn open(user_id: Uuid) -> Self {
        Self {
            user_id,
            kaus_balance: round8(Decimal::ZERO),
            pending_kaus: round8(Decimal::ZERO),
            total_earnings: round8(Decimal::ZERO),
            total_deposits: round8(Decimal::ZERO),
            total_withdrawals: round8(Decimal::ZERO),
            updated_at: Utc::now(),
        }
    }

    /// `kaus_balance - pending_kaus`
    pub fn available(&self) -> Decimal {
        sub8(self.kaus_balance, self.pending_kaus)
    }

    /// Apply a posted transaction to the balance and its accumulators.
    /// Returns `(balance_before, balance_after)`.
    pub fn apply(&mut self, kind: TransactionType, amount: Decimal) -> (Decimal, Decimal) {
        let before = self.kaus_balance;
        let after = add8(before, kind.signed(amount));
        self.kaus_balance = after;
        match kind {
            TransactionType::Purchase => {
                self.total_deposits = add8(self.total_deposits, amount);
            }
            TransactionType::ReferralBonus => {
                self.total_earnings = add8(self.total_earnings, amount);
            }
            TransactionType::Withdrawal => {
                self.pending_kaus = sub8(self.pending_kaus, amount);
                self.total_withdrawals = add8(self.total_withdrawals, amount);
            }
        }
        self.updated_at = Utc::now();
        (before, after)
    }
}

// =========================================================================
// Transactions
// =========================================================================

/// Kind of ledger transaction; encodes the credit/debit direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Purchase,
    Withdrawal,
    ReferralBonus,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Purchase => "PURCHASE",
            TransactionType::Withdrawal => "WITHDRAWAL",
            TransactionType::ReferralBonus => "REFERRAL_BONUS",
        }
    }

    pub fn is_credit(&self) -> bool {
        !matches!(self, TransactionType::Withdrawal)
    }

    /// Amount with the direction of this transaction type applied
    pub fn signed(&self, amount: Decimal) -> Decimal {
        if self.is_credit() {
            amount
        } else {
            -amount
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for TransactionType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "PURCHASE" => Ok(TransactionType::Purchase),
            "WITHDRAWAL" => Ok(TransactionType::Withdrawal),
            "REFERRAL_BONUS" => Ok(TransactionType::ReferralBonus),
            other => Err(format!("unknown transaction type: {}", other)),
        }
    }
}

/// Immutable ledger transaction row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    /// Always positive; direction comes from `kind`
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    /// Business reference (order id, referral id, withdrawal id)
    pub reference_id: String,
    /// Globally unique; the double-spend barrier
    pub idempotency_key: String,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

impl LedgerTransaction {
    pub fn signed_amount(&self) -> Decimal {
        self.kind.signed(self.amount)
    }

    /// `balance_after == round8(balance_before + signed_amount)`
    pub fn is_balanced(&self) -> bool {
        self.balance_after == add8(self.balance_before, self.signed_amount())
    }
}

// =========================================================================
// Referrals
// =========================================================================

/// A user's shareable referral code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralCode {
    pub code: String,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReferralStatus {
    Active,
}

impl ReferralStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferralStatus::Active => "ACTIVE",
        }
    }
}

/// Pairing of a referrer and a referee
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralLink {
    pub id: Uuid,
    pub referrer_id: Uuid,
    /// Unique across all links
    pub referee_id: Uuid,
    pub referral_code: String,
    pub signup_bonus_referrer: Decimal,
    pub signup_bonus_referee: Decimal,
    pub first_purchase_bonus_granted: bool,
    pub purchase_bonus_referrer: Option<Decimal>,
    pub purchase_bonus_referee: Option<Decimal>,
    pub status: ReferralStatus,
    pub created_at: DateTime<Utc>,
}

// =========================================================================
// Withdrawals
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WithdrawalStatus {
    Pending,
    Completed,
    Rejected,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "PENDING",
            WithdrawalStatus::Completed => "COMPLETED",
            WithdrawalStatus::Rejected => "REJECTED",
        }
    }
}

impl TryFrom<String> for WithdrawalStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "PENDING" => Ok(WithdrawalStatus::Pending),
            "COMPLETED" => Ok(WithdrawalStatus::Completed),
            "REJECTED" => Ok(WithdrawalStatus::Rejected),
            other => Err(format!("unknown withdrawal status: {}", other)),
        }
    }
}

/// Opaque payout target; must match the withdrawal method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum WithdrawalDestination {
    Bank {
        bank_name: String,
        account_number: String,
        account_holder: String,
    },
    Paypal {
        email: String,
    },
    Crypto {
        address: String,
    },
}

impl WithdrawalDestination {
    pub fn method(&self) -> WithdrawalMethod {
        match self {
            WithdrawalDestination::Bank { .. } => WithdrawalMethod::Bank,
            WithdrawalDestination::Paypal { .. } => WithdrawalMethod::Paypal,
            WithdrawalDestination::Crypto { .. } => WithdrawalMethod::Crypto,
        }
    }

    /// True when no field is blank
    pub fn is_complete(&self) -> bool {
        match self {
            WithdrawalDestination::Bank {
                bank_name,
                account_number,
                account_holder,
            } => ![bank_name, account_number, account_holder]
                .iter()
                .any(|s| s.trim().is_empty()),
            WithdrawalDestination::Paypal { email } => email.contains('@'),
            WithdrawalDestination::Crypto { address } => !address.trim().is_empty(),
        }
    }
}

/// Withdrawal request and its reservation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Fiat amount requested
    pub amount: Decimal,
    pub currency: Currency,
    pub method: WithdrawalMethod,
    pub fee: Decimal,
    pub net_amount: Decimal,
    /// KAUS reserved into `pending_kaus` for this request
    pub kaus_amount: Decimal,
    pub status: WithdrawalStatus,
    pub destination: WithdrawalDestination,
    pub estimated_arrival: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Set when the payout process rejects the request
    pub rejection_reason: Option<String>,
}

// =========================================================================
// Purchase orders
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Paypal,
    Toss,
    Card,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Paypal => "paypal",
            PaymentMethod::Toss => "toss",
            PaymentMethod::Card => "card",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Completed,
}

/// A package purchase waiting for payment confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseOrder {
    /// `KAUS-...` reference id carried by the payment provider
    pub reference_id: String,
    pub user_id: Uuid,
    pub package_id: String,
    pub kaus_amount: Decimal,
    pub bonus_amount: Decimal,
    pub total_kaus: Decimal,
    pub price: Decimal,
    pub currency: Currency,
    pub payment_method: PaymentMethod,
    pub status: OrderStatus,
    pub transaction_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
