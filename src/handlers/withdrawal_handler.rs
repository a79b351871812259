//! Withdrawal Handler
//!
//! Validates payout requests, computes the method fee and reserves the
//! KAUS equivalent in `pending_kaus` until the payout process resolves
//! the request.

use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditEventType, AuditRecord, AuditSink, AuditStatus};
use crate::domain::precision::sub8;
use crate::domain::{
    kaus_from_fiat, LedgerError, OperationContext, WithdrawalRequest, WithdrawalStatus,
};
use crate::store::{LedgerStore, WithdrawalResolution};

use super::{reconciliation_required, WithdrawalCommand, WithdrawalReceipt};

/// Handler for withdrawal requests and their resolution
#[derive(Clone)]
pub struct WithdrawalHandler {
    store: Arc<dyn LedgerStore>,
    audit: Arc<dyn AuditSink>,
}

impl WithdrawalHandler {
    pub fn new(store: Arc<dyn LedgerStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    // =========================================================================
    // request_withdrawal
    // =========================================================================

    /// Validate and reserve a withdrawal.
    ///
    /// Checks run in order and the first failure wins: minimum, maximum,
    /// account, available balance, then the payout destination.
    pub async fn request_withdrawal(
        &self,
        command: WithdrawalCommand,
        context: &OperationContext,
    ) -> Result<WithdrawalReceipt, LedgerError> {
        let amount = command.amount.value();
        let currency = command.currency;

        if amount < currency.min_withdrawal() {
            return Err(LedgerError::BelowMinimum {
                min: currency.min_withdrawal(),
                currency,
            });
        }

        if amount > currency.max_withdrawal() {
            return Err(LedgerError::AboveMaximum {
                max: currency.max_withdrawal(),
                currency,
            });
        }

        let account = self
            .store
            .get_account(command.user_id)
            .await?
            .ok_or(LedgerError::UserNotFound(command.user_id))?;

        let kaus_amount = kaus_from_fiat(amount, currency);
        let available = account.available();
        if available < kaus_amount {
            return Err(LedgerError::insufficient_balance(kaus_amount, available));
        }

        if command.destination.method() != command.method {
            return Err(LedgerError::InvalidDestination(format!(
                "destination does not match method {}",
                command.method
            )));
        }
        if !command.destination.is_complete() {
            return Err(LedgerError::InvalidDestination(
                "destination is missing required fields".to_string(),
            ));
        }

        let fee = command.method.fee_for(amount, currency);
        let net_amount = sub8(amount, fee);
        let now = Utc::now();

        let request = WithdrawalRequest {
            id: Uuid::new_v4(),
            user_id: command.user_id,
            amount,
            currency,
            method: command.method,
            fee,
            net_amount,
            kaus_amount,
            status: WithdrawalStatus::Pending,
            destination: command.destination,
            estimated_arrival: now + Duration::days(command.method.arrival_days()),
            created_at: now,
            resolved_at: None,
            rejection_reason: None,
        };

        // The store re-checks the available balance under the account lock
        let request = self.store.reserve_withdrawal(request).await?;

        let record = AuditRecord::fiat(
            AuditEventType::WithdrawalRequest,
            request.user_id,
            request.amount,
            currency,
        )
        .status(AuditStatus::Pending)
        .detail("withdrawalId", request.id)
        .detail("method", request.method)
        .detail("fee", request.fee)
        .detail("netAmount", request.net_amount)
        .detail("kausAmount", request.kaus_amount)
        .with_context(context);

        if let Err(e) = self.audit.append(record).await {
            return Err(reconciliation_required(
                "request_withdrawal",
                format!("withdrawal {} reserved but audit failed: {}", request.id, e),
                vec![request.id],
            ));
        }

        tracing::info!(
            withdrawal_id = %request.id,
            user_id = %request.user_id,
            amount = %request.amount,
            currency = %currency,
            fee = %request.fee,
            "Withdrawal requested"
        );

        Ok(WithdrawalReceipt {
            withdrawal_id: request.id,
            amount: request.amount,
            currency,
            fee: request.fee,
            net_amount: request.net_amount,
            kaus_amount: request.kaus_amount,
            status: request.status,
            estimated_arrival: request.estimated_arrival,
        })
    }

    pub async fn get_withdrawal(&self, id: Uuid) -> Result<WithdrawalRequest, LedgerError> {
        self.store
            .get_withdrawal(id)
            .await?
            .ok_or(LedgerError::WithdrawalNotFound(id))
    }

    // =========================================================================
    // Payout callbacks
    // =========================================================================

    /// Payout succeeded: debit the balance and release the reservation
    pub async fn complete_withdrawal(
        &self,
        id: Uuid,
        context: &OperationContext,
    ) -> Result<WithdrawalRequest, LedgerError> {
        let resolved = self
            .store
            .resolve_withdrawal(id, WithdrawalResolution::Complete)
            .await?;
        let withdrawal = resolved.withdrawal;

        let mut record = AuditRecord::kaus(
            AuditEventType::WithdrawalComplete,
            withdrawal.user_id,
            withdrawal.kaus_amount,
        )
        .detail("withdrawalId", withdrawal.id)
        .detail("fiatAmount", withdrawal.amount)
        .detail("currency", withdrawal.currency)
        .detail("netAmount", withdrawal.net_amount);
        if let Some(tx) = &resolved.transaction {
            record = record
                .detail("transactionId", tx.id)
                .detail("balanceBefore", tx.balance_before)
                .detail("balanceAfter", tx.balance_after);
        }

        if let Err(e) = self.audit.append(record.with_context(context)).await {
            let applied = resolved.transaction.iter().map(|tx| tx.id).collect();
            return Err(reconciliation_required(
                "complete_withdrawal",
                format!("withdrawal {} completed but audit failed: {}", withdrawal.id, e),
                applied,
            ));
        }

        tracing::info!(
            withdrawal_id = %withdrawal.id,
            user_id = %withdrawal.user_id,
            kaus_amount = %withdrawal.kaus_amount,
            "Withdrawal completed"
        );

        Ok(withdrawal)
    }

    /// Payout refused: release the reservation, balance untouched
    pub async fn reject_withdrawal(
        &self,
        id: Uuid,
        reason: String,
        context: &OperationContext,
    ) -> Result<WithdrawalRequest, LedgerError> {
        let resolved = self
            .store
            .resolve_withdrawal(
                id,
                WithdrawalResolution::Reject {
                    reason: reason.clone(),
                },
            )
            .await?;
        let withdrawal = resolved.withdrawal;

        let record = AuditRecord::kaus(
            AuditEventType::WithdrawalRejected,
            withdrawal.user_id,
            withdrawal.kaus_amount,
        )
        .status(AuditStatus::Failed)
        .detail("withdrawalId", withdrawal.id)
        .detail("reason", &reason)
        .with_context(context);

        if let Err(e) = self.audit.append(record).await {
            return Err(reconciliation_required(
                "reject_withdrawal",
                format!("withdrawal {} rejected but audit failed: {}", withdrawal.id, e),
                vec![withdrawal.id],
            ));
        }

        tracing::info!(
            withdrawal_id = %withdrawal.id,
            reason = %reason,
            "Withdrawal rejected"
        );

        Ok(withdrawal)
    }
}
