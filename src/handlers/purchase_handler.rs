//! Purchase Handler
//!
//! Package orders and the payment-confirmed webhook flow: order lookup,
//! amount verification, settlement, then the first-purchase referral bonus.

use chrono::Utc;
use rand::Rng;
use std::sync::Arc;

use crate::audit::{AuditEventType, AuditRecord, AuditSink, AuditStatus};
use crate::domain::{
    Amount, LedgerError, OperationContext, OrderStatus, Package, PurchaseOrder,
};
use crate::idempotency::IdempotencyGuard;
use crate::store::LedgerStore;

use super::{
    CompletePurchaseCommand, FirstPurchaseBonusCommand, FirstPurchaseOutcome,
    InitiatePurchaseCommand, PaymentConfirmedEvent, PaymentSettlement, PurchaseQuote,
    ReferralBonusStatus, ReferralHandler, SettlementHandler,
};

const REFERENCE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// `KAUS-<millis>-<6 random>`
pub fn generate_reference_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| REFERENCE_ALPHABET[rng.gen_range(0..REFERENCE_ALPHABET.len())] as char)
        .collect();
    format!("KAUS-{}-{}", Utc::now().timestamp_millis(), suffix)
}

/// Handler for package purchases
#[derive(Clone)]
pub struct PurchaseHandler {
    store: Arc<dyn LedgerStore>,
    audit: Arc<dyn AuditSink>,
    guard: IdempotencyGuard,
    settlement: SettlementHandler,
    referrals: ReferralHandler,
}

impl PurchaseHandler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        audit: Arc<dyn AuditSink>,
        settlement: SettlementHandler,
        referrals: ReferralHandler,
    ) -> Self {
        Self {
            guard: IdempotencyGuard::new(store.clone()),
            store,
            audit,
            settlement,
            referrals,
        }
    }

    // =========================================================================
    // initiate_purchase
    // =========================================================================

    /// Create a PENDING order for a package and return its quote
    pub async fn initiate_purchase(
        &self,
        command: InitiatePurchaseCommand,
        context: &OperationContext,
    ) -> Result<PurchaseQuote, LedgerError> {
        let package = Package::find(&command.package_id)
            .ok_or_else(|| LedgerError::UnknownPackage(command.package_id.clone()))?;

        if self.store.get_account(command.user_id).await?.is_none() {
            return Err(LedgerError::UserNotFound(command.user_id));
        }

        let order = PurchaseOrder {
            reference_id: generate_reference_id(),
            user_id: command.user_id,
            package_id: package.id.to_string(),
            kaus_amount: package.kaus_amount,
            bonus_amount: package.bonus_amount(),
            total_kaus: package.total_kaus(),
            price: package.price(command.currency),
            currency: command.currency,
            payment_method: command.payment_method,
            status: OrderStatus::Pending,
            transaction_id: None,
            created_at: Utc::now(),
        };

        self.store.create_order(order.clone()).await?;

        let record = AuditRecord::fiat(
            AuditEventType::KausPurchase,
            order.user_id,
            order.price,
            order.currency,
        )
        .status(AuditStatus::Pending)
        .detail("referenceId", &order.reference_id)
        .detail("packageId", &order.package_id)
        .detail("paymentMethod", order.payment_method)
        .detail("totalKaus", order.total_kaus)
        .with_context(context);

        // Nothing moved yet; a missing PENDING record only blocks this order
        self.audit
            .append(record)
            .await
            .map_err(|e| LedgerError::StoreUnavailable(e.to_string()))?;

        tracing::info!(
            reference_id = %order.reference_id,
            user_id = %order.user_id,
            package_id = %order.package_id,
            "Purchase initiated"
        );

        Ok(PurchaseQuote {
            reference_id: order.reference_id,
            package_id: order.package_id,
            kaus_amount: order.kaus_amount,
            bonus_amount: order.bonus_amount,
            total_kaus: order.total_kaus,
            price: order.price,
            currency: order.currency,
            payment_method: order.payment_method,
        })
    }

    // =========================================================================
    // handle_payment
    // =========================================================================

    /// Settle a verified payment-confirmed event.
    ///
    /// The provider's payment id is the idempotency key, so redelivered
    /// webhooks settle to the original receipt.
    pub async fn handle_payment(
        &self,
        event: PaymentConfirmedEvent,
        context: &OperationContext,
    ) -> Result<PaymentSettlement, LedgerError> {
        let order = self
            .store
            .get_order(&event.reference_id)
            .await?
            .ok_or_else(|| LedgerError::OrderNotFound(event.reference_id.clone()))?;

        if event.currency != order.currency {
            return Err(LedgerError::PaymentMismatch {
                reference_id: order.reference_id,
                reason: format!("paid in {}, order priced in {}", event.currency, order.currency),
            });
        }
        if event.amount.value() < order.price {
            return Err(LedgerError::PaymentMismatch {
                reference_id: order.reference_id,
                reason: format!("paid {}, expected {}", event.amount, order.price),
            });
        }

        // Early refusal only; the store claims the order together with the credit
        if order.status == OrderStatus::Completed
            && !self.guard.is_already_processed(&event.payment_id).await?
        {
            return Err(LedgerError::PaymentMismatch {
                reference_id: order.reference_id,
                reason: "order already settled by another payment".to_string(),
            });
        }

        let command = CompletePurchaseCommand::new(
            order.user_id,
            order.reference_id.clone(),
            Amount::new(order.total_kaus)?,
            event.payment_id.clone(),
        )?;
        let outcome = match self.settlement.complete_purchase(command, context).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record_grant_failure(&order, &event, &e, context).await;
                return Err(e);
            }
        };

        if order.status == OrderStatus::Pending {
            self.store
                .complete_order(&order.reference_id, outcome.receipt().transaction_id)
                .await?;
        }

        // A replay against a still-PENDING order resumes an interrupted run
        let referral_bonus = if outcome.is_replay() && order.status == OrderStatus::Completed {
            ReferralBonusStatus::Skipped
        } else {
            self.first_purchase_bonus(&order, context).await
        };

        tracing::info!(
            reference_id = %order.reference_id,
            payment_id = %event.payment_id,
            provider = event.provider.as_str(),
            replay = outcome.is_replay(),
            "Payment handled"
        );

        Ok(PaymentSettlement {
            reference_id: order.reference_id,
            user_id: order.user_id,
            outcome,
            referral_bonus,
        })
    }

    /// The provider captured the payment but the credit did not go through
    async fn record_grant_failure(
        &self,
        order: &PurchaseOrder,
        event: &PaymentConfirmedEvent,
        error: &LedgerError,
        context: &OperationContext,
    ) {
        tracing::error!(
            alert = "payment_captured_grant_failed",
            reference_id = %order.reference_id,
            payment_id = %event.payment_id,
            user_id = %order.user_id,
            error = %error,
            "Payment captured but KAUS not credited"
        );

        let record = AuditRecord::kaus(AuditEventType::SecurityIncident, order.user_id, order.total_kaus)
            .status(AuditStatus::Failed)
            .detail("type", "PAYMENT_CAPTURED_BUT_GRANT_FAILED")
            .detail("referenceId", &order.reference_id)
            .detail("paymentId", &event.payment_id)
            .detail("provider", event.provider)
            .detail("error", error.code())
            .detail("requiresManualIntervention", !error.is_retryable())
            .with_context(context);

        if let Err(e) = self.audit.append(record).await {
            tracing::warn!(error = %e, "Failed to audit grant failure");
        }
    }

    /// A bonus failure never undoes the settled payment; it is reported
    async fn first_purchase_bonus(
        &self,
        order: &PurchaseOrder,
        context: &OperationContext,
    ) -> ReferralBonusStatus {
        let purchase_amount = match Amount::new(order.total_kaus) {
            Ok(amount) => amount,
            Err(e) => {
                return ReferralBonusStatus::Failed {
                    code: LedgerError::from(e).code().to_string(),
                }
            }
        };

        let command = FirstPurchaseBonusCommand {
            referee_id: order.user_id,
            purchase_amount,
        };

        match self.referrals.grant_first_purchase_bonus(command, context).await {
            Ok(FirstPurchaseOutcome::Granted(result)) => ReferralBonusStatus::Granted {
                referrer_bonus: result.referrer_bonus,
                referee_bonus: result.referee_bonus,
            },
            Ok(FirstPurchaseOutcome::AlreadyGranted) => ReferralBonusStatus::AlreadyGranted,
            Ok(FirstPurchaseOutcome::NotReferred) => ReferralBonusStatus::NotReferred,
            Err(e) => {
                tracing::warn!(
                    reference_id = %order.reference_id,
                    user_id = %order.user_id,
                    error = %e,
                    "First purchase bonus failed after settlement"
                );
                ReferralBonusStatus::Failed {
                    code: e.code().to_string(),
                }
            }
        }
    }

    pub async fn get_order(&self, reference_id: &str) -> Result<PurchaseOrder, LedgerError> {
        self.store
            .get_order(reference_id)
            .await?
            .ok_or_else(|| LedgerError::OrderNotFound(reference_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_id_format() {
        let id = generate_reference_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "KAUS");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 6);
        assert!(crate::idempotency::validate_key(&id).is_ok());
    }
}
