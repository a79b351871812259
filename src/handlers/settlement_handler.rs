//! Settlement Handler
//!
//! Turns a verified payment into exactly one balance credit, one
//! transaction row and one audit record per idempotency key.

use std::sync::Arc;

use crate::audit::{AuditEventType, AuditRecord, AuditSink};
use crate::domain::{LedgerError, LedgerTransaction, OperationContext, TransactionType};
use crate::idempotency::IdempotencyGuard;
use crate::store::{LedgerStore, NewTransaction, PostOutcome};

use super::{reconciliation_required, CompletePurchaseCommand, SettlementOutcome, SettlementReceipt};

/// Handler for purchase settlement
#[derive(Clone)]
pub struct SettlementHandler {
    store: Arc<dyn LedgerStore>,
    audit: Arc<dyn AuditSink>,
    guard: IdempotencyGuard,
}

impl SettlementHandler {
    pub fn new(store: Arc<dyn LedgerStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            guard: IdempotencyGuard::new(store.clone()),
            store,
            audit,
        }
    }

    // =========================================================================
    // complete_purchase
    // =========================================================================

    /// Credit `total_amount` to the user, once per idempotency key
    pub async fn complete_purchase(
        &self,
        command: CompletePurchaseCommand,
        context: &OperationContext,
    ) -> Result<SettlementOutcome, LedgerError> {
        // 1. Guard check
        if let Some(existing) = self.guard.lookup(&command.idempotency_key).await? {
            return replay(&command, existing);
        }

        // 2. Account must exist
        if self.store.get_account(command.user_id).await?.is_none() {
            return Err(LedgerError::UserNotFound(command.user_id));
        }

        // 3-4. Atomic credit; the unique key settles concurrent duplicates
        let outcome = self
            .store
            .post_transaction(NewTransaction {
                user_id: command.user_id,
                kind: TransactionType::Purchase,
                amount: command.total_amount.value(),
                reference_id: command.order_id.clone(),
                idempotency_key: command.idempotency_key.clone(),
            })
            .await?;

        let tx = match outcome {
            PostOutcome::Applied(tx) => tx,
            PostOutcome::Duplicate(existing) => {
                tracing::info!(
                    idempotency_key = %command.idempotency_key,
                    "Concurrent duplicate settlement resolved by unique key"
                );
                return replay(&command, existing);
            }
        };

        // 5. Audit
        let record = AuditRecord::kaus(AuditEventType::KausPurchase, tx.user_id, tx.amount)
            .detail("referenceId", &tx.reference_id)
            .detail("idempotencyKey", &tx.idempotency_key)
            .detail("transactionId", tx.id)
            .detail("balanceBefore", tx.balance_before)
            .detail("balanceAfter", tx.balance_after)
            .with_context(context);

        if let Err(e) = self.audit.append(record).await {
            return Err(reconciliation_required(
                "complete_purchase",
                format!("credit {} applied but audit failed: {}", tx.id, e),
                vec![tx.id],
            ));
        }

        tracing::info!(
            user_id = %tx.user_id,
            transaction_id = %tx.id,
            idempotency_key = %tx.idempotency_key,
            amount = %tx.amount,
            new_balance = %tx.balance_after,
            "Purchase settled"
        );

        Ok(SettlementOutcome::Settled(SettlementReceipt {
            transaction_id: tx.id,
            new_balance: tx.balance_after,
        }))
    }
}

/// Map a previously recorded transaction to `AlreadyProcessed`, refusing
/// reuse of the key for a different credit
fn replay(
    command: &CompletePurchaseCommand,
    existing: LedgerTransaction,
) -> Result<SettlementOutcome, LedgerError> {
    let same_request = existing.kind == TransactionType::Purchase
        && existing.user_id == command.user_id
        && existing.reference_id == command.order_id
        && existing.amount == command.total_amount.value();

    if !same_request {
        tracing::warn!(
            idempotency_key = %command.idempotency_key,
            "Idempotency key reused with different parameters"
        );
        return Err(LedgerError::IdempotencyConflict {
            key: command.idempotency_key.clone(),
        });
    }

    tracing::debug!(
        idempotency_key = %command.idempotency_key,
        transaction_id = %existing.id,
        "Settlement already processed"
    );

    Ok(SettlementOutcome::AlreadyProcessed(SettlementReceipt {
        transaction_id: existing.id,
        new_balance: existing.balance_after,
    }))
}
