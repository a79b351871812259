//! Domain module
//!
//! Core ledger types and the precision rules every component relies on.

pub mod amount;
pub mod context;
pub mod currency;
pub mod error;
pub mod model;
pub mod package;
pub mod precision;

pub use amount::{Amount, AmountError};
pub use context::OperationContext;
pub use currency::{fiat_from_kaus, kaus_from_fiat, Currency, WithdrawalMethod};
pub use error::{ErrorKind, LedgerError};
pub use model::{
    AccountBalance, LedgerTransaction, OrderStatus, PaymentMethod, PurchaseOrder, ReferralCode,
    ReferralLink, ReferralStatus, TransactionType, WithdrawalDestination, WithdrawalRequest,
    WithdrawalStatus,
};
pub use package::{Package, PURCHASE_PACKAGES};
pub use precision::{round8, DECIMAL_PRECISION};
