//! In-memory Ledger Store
//!
//! Single-process implementation used by tests, the load-test binary and
//! local runs without a database. One write lock serializes every
//! mutation, which gives the same atomicity as the row locks in
//! PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{
    AccountBalance, LedgerTransaction, OrderStatus, PurchaseOrder, ReferralCode, ReferralLink,
    TransactionType, WithdrawalRequest, WithdrawalStatus,
};

use super::{
    withdrawal_settlement_key, LedgerStore, NewTransaction, PostOutcome, ResolvedWithdrawal,
    StoreError, WithdrawalResolution,
};

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<Uuid, AccountBalance>,
    transactions: Vec<LedgerTransaction>,
    by_key: HashMap<String, usize>,
    /// Order reference -> index of its PURCHASE row
    purchases: HashMap<String, usize>,
    orders: HashMap<String, PurchaseOrder>,
    codes: HashMap<String, ReferralCode>,
    referrals: Vec<ReferralLink>,
    withdrawals: HashMap<Uuid, WithdrawalRequest>,
}

impl State {
    fn insert_transaction(&mut self, tx: LedgerTransaction) {
        let idx = self.transactions.len();
        self.by_key.insert(tx.idempotency_key.clone(), idx);
        if tx.kind == TransactionType::Purchase {
            self.purchases.insert(tx.reference_id.clone(), idx);
        }
        self.transactions.push(tx);
    }
}

/// Ledger store backed by process memory
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    state: RwLock<State>,
    failing_users: RwLock<HashSet<Uuid>>,
    order_read_delay: RwLock<Option<Duration>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every posting for `user_id` fail with `StoreError::Unavailable`
    pub async fn fail_postings_for(&self, user_id: Uuid) {
        self.failing_users.write().await.insert(user_id);
    }

    pub async fn clear_failures(&self) {
        self.failing_users.write().await.clear();
    }

    /// Stall every `get_order` by `delay`, like a slow database round trip
    pub async fn delay_order_reads(&self, delay: Duration) {
        *self.order_read_delay.write().await = Some(delay);
    }

    /// Number of stored transactions
    pub async fn transaction_count(&self) -> usize {
        self.state.read().await.transactions.len()
    }

    async fn check_failure(&self, user_id: Uuid) -> Result<(), StoreError> {
        if self.failing_users.read().await.contains(&user_id) {
            return Err(StoreError::Unavailable(format!(
                "injected failure for {}",
                user_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn open_account(&self, user_id: Uuid) -> Result<AccountBalance, StoreError> {
        let mut state = self.state.write().await;
        if state.accounts.contains_key(&user_id) {
            return Err(StoreError::AccountExists(user_id));
        }
        let account = AccountBalance::open(user_id);
        state.accounts.insert(user_id, account.clone());
        Ok(account)
    }

    async fn get_account(&self, user_id: Uuid) -> Result<Option<AccountBalance>, StoreError> {
        Ok(self.state.read().await.accounts.get(&user_id).cloned())
    }

    async fn find_transaction_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<LedgerTransaction>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .by_key
            .get(key)
            .and_then(|idx| state.transactions.get(*idx))
            .cloned())
    }

    async fn list_transactions(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<LedgerTransaction>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|tx| tx.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn post_transaction(&self, new_tx: NewTransaction) -> Result<PostOutcome, StoreError> {
        self.check_failure(new_tx.user_id).await?;

        let mut state = self.state.write().await;

        if let Some(idx) = state.by_key.get(&new_tx.idempotency_key) {
            let existing = state.transactions[*idx].clone();
            return Ok(PostOutcome::Duplicate(existing));
        }

        // One PURCHASE row per order reference
        if new_tx.kind == TransactionType::Purchase
            && state.purchases.contains_key(&new_tx.reference_id)
        {
            return Err(StoreError::OrderAlreadySettled(new_tx.reference_id));
        }

        let account = state
            .accounts
            .get_mut(&new_tx.user_id)
            .ok_or(StoreError::AccountNotFound(new_tx.user_id))?;

        if !new_tx.kind.is_credit() && account.available() < new_tx.amount {
            return Err(StoreError::InsufficientBalance {
                required: new_tx.amount,
                available: account.available(),
            });
        }

        let (balance_before, balance_after) = account.apply(new_tx.kind, new_tx.amount);

        let tx = LedgerTransaction {
            id: Uuid::new_v4(),
            user_id: new_tx.user_id,
            kind: new_tx.kind,
            amount: new_tx.amount,
            balance_before,
            balance_after,
            reference_id: new_tx.reference_id,
            idempotency_key: new_tx.idempotency_key,
            verified: true,
            created_at: Utc::now(),
        };
        state.insert_transaction(tx.clone());

        if tx.kind == TransactionType::Purchase {
            if let Some(order) = state.orders.get_mut(&tx.reference_id) {
                if order.status == OrderStatus::Pending {
                    order.status = OrderStatus::Completed;
                    order.transaction_id = Some(tx.id);
                }
            }
        }

        Ok(PostOutcome::Applied(tx))
    }

    async fn create_order(&self, order: PurchaseOrder) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.orders.contains_key(&order.reference_id) {
            return Err(StoreError::DuplicateOrder(order.reference_id));
        }
        state.orders.insert(order.reference_id.clone(), order);
        Ok(())
    }

    async fn get_order(&self, reference_id: &str) -> Result<Option<PurchaseOrder>, StoreError> {
        let delay = *self.order_read_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.state.read().await.orders.get(reference_id).cloned())
    }

    async fn complete_order(
        &self,
        reference_id: &str,
        transaction_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(reference_id)
            .ok_or_else(|| StoreError::OrderNotFound(reference_id.to_string()))?;
        match (order.status, order.transaction_id) {
            (OrderStatus::Pending, _) => {
                order.status = OrderStatus::Completed;
                order.transaction_id = Some(transaction_id);
                Ok(())
            }
            (OrderStatus::Completed, Some(settled_by)) if settled_by == transaction_id => Ok(()),
            _ => Err(StoreError::OrderAlreadySettled(reference_id.to_string())),
        }
    }

    async fn find_referral_code(&self, code: &str) -> Result<Option<ReferralCode>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .codes
            .get(&code.to_uppercase())
            .cloned())
    }

    async fn find_referral_code_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Option<ReferralCode>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .codes
            .values()
            .find(|c| c.user_id == user_id)
            .cloned())
    }

    async fn insert_referral_code(&self, code: ReferralCode) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let key = code.code.to_uppercase();
        if state.codes.contains_key(&key) || state.codes.values().any(|c| c.user_id == code.user_id)
        {
            return Err(StoreError::DuplicateReferralCode(code.code));
        }
        state.codes.insert(key, code);
        Ok(())
    }

    async fn find_referral_by_referee(
        &self,
        referee_id: Uuid,
    ) -> Result<Option<ReferralLink>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .referrals
            .iter()
            .find(|r| r.referee_id == referee_id)
            .cloned())
    }

    async fn list_referrals_by_referrer(
        &self,
        referrer_id: Uuid,
    ) -> Result<Vec<ReferralLink>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .referrals
            .iter()
            .filter(|r| r.referrer_id == referrer_id)
            .cloned()
            .collect())
    }

    async fn insert_referral(
        &self,
        link: ReferralLink,
        max_per_referrer: usize,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.referrals.iter().any(|r| r.referee_id == link.referee_id) {
            return Err(StoreError::DuplicateReferee(link.referee_id));
        }
        let taken = state
            .referrals
            .iter()
            .filter(|r| r.referrer_id == link.referrer_id)
            .count();
        if taken >= max_per_referrer {
            return Err(StoreError::ReferralLimitReached(link.referrer_id));
        }
        state.referrals.push(link);
        Ok(())
    }

    async fn mark_first_purchase_bonus(
        &self,
        referral_id: Uuid,
        referrer_bonus: Decimal,
        referee_bonus: Decimal,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let link = state
            .referrals
            .iter_mut()
            .find(|r| r.id == referral_id)
            .ok_or_else(|| StoreError::Corrupt(format!("referral {} missing", referral_id)))?;
        if link.first_purchase_bonus_granted {
            return Ok(false);
        }
        link.first_purchase_bonus_granted = true;
        link.purchase_bonus_referrer = Some(referrer_bonus);
        link.purchase_bonus_referee = Some(referee_bonus);
        Ok(true)
    }

    async fn reserve_withdrawal(
        &self,
        request: WithdrawalRequest,
    ) -> Result<WithdrawalRequest, StoreError> {
        self.check_failure(request.user_id).await?;

        let mut state = self.state.write().await;
        let account = state
            .accounts
            .get_mut(&request.user_id)
            .ok_or(StoreError::AccountNotFound(request.user_id))?;

        let available = account.available();
        if available < request.kaus_amount {
            return Err(StoreError::InsufficientBalance {
                required: request.kaus_amount,
                available,
            });
        }
        account.pending_kaus += request.kaus_amount;
        account.updated_at = Utc::now();

        state.withdrawals.insert(request.id, request.clone());
        Ok(request)
    }

    async fn get_withdrawal(&self, id: Uuid) -> Result<Option<WithdrawalRequest>, StoreError> {
        Ok(self.state.read().await.withdrawals.get(&id).cloned())
    }

    async fn resolve_withdrawal(
        &self,
        id: Uuid,
        resolution: WithdrawalResolution,
    ) -> Result<ResolvedWithdrawal, StoreError> {
        let mut state = self.state.write().await;
        let withdrawal = state
            .withdrawals
            .get(&id)
            .cloned()
            .ok_or(StoreError::WithdrawalNotFound(id))?;

        if withdrawal.status != WithdrawalStatus::Pending {
            return Err(StoreError::InvalidWithdrawalState {
                id,
                status: withdrawal.status.as_str().to_string(),
            });
        }

        let account = state
            .accounts
            .get_mut(&withdrawal.user_id)
            .ok_or(StoreError::AccountNotFound(withdrawal.user_id))?;

        let (status, transaction, rejection_reason) = match resolution {
            WithdrawalResolution::Complete => {
                let (balance_before, balance_after) =
                    account.apply(TransactionType::Withdrawal, withdrawal.kaus_amount);
                let tx = LedgerTransaction {
                    id: Uuid::new_v4(),
                    user_id: withdrawal.user_id,
                    kind: TransactionType::Withdrawal,
                    amount: withdrawal.kaus_amount,
                    balance_before,
                    balance_after,
                    reference_id: id.to_string(),
                    idempotency_key: withdrawal_settlement_key(id),
                    verified: true,
                    created_at: Utc::now(),
                };
                (WithdrawalStatus::Completed, Some(tx), None)
            }
            WithdrawalResolution::Reject { reason } => {
                account.pending_kaus -= withdrawal.kaus_amount;
                account.updated_at = Utc::now();
                (WithdrawalStatus::Rejected, None, Some(reason))
            }
        };

        if let Some(tx) = &transaction {
            state.insert_transaction(tx.clone());
        }

        let resolved = WithdrawalRequest {
            status,
            resolved_at: Some(Utc::now()),
            rejection_reason,
            ..withdrawal
        };
        state.withdrawals.insert(id, resolved.clone());

        Ok(ResolvedWithdrawal {
            withdrawal: resolved,
            transaction,
        })
    }

    async fn list_pending_withdrawals_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WithdrawalRequest>, StoreError> {
        let state = self.state.read().await;
        let mut pending: Vec<_> = state
            .withdrawals
            .values()
            .filter(|w| w.status == WithdrawalStatus::Pending && w.created_at < cutoff)
            .cloned()
            .collect();
        pending.sort_by_key(|w| w.created_at);
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Currency, WithdrawalDestination, WithdrawalMethod};
    use rust_decimal_macros::dec;

    fn credit(user_id: Uuid, amount: Decimal, key: &str) -> NewTransaction {
        NewTransaction {
            user_id,
            kind: TransactionType::Purchase,
            amount,
            reference_id: format!("KAUS-{}", key),
            idempotency_key: key.to_string(),
        }
    }

    fn order_payment(user_id: Uuid, reference_id: &str, key: &str) -> NewTransaction {
        NewTransaction {
            reference_id: reference_id.to_string(),
            ..credit(user_id, dec!(1000), key)
        }
    }

    fn withdrawal(user_id: Uuid, kaus_amount: Decimal) -> WithdrawalRequest {
        WithdrawalRequest {
            id: Uuid::new_v4(),
            user_id,
            amount: dec!(12000),
            currency: Currency::Krw,
            method: WithdrawalMethod::Bank,
            fee: dec!(1000),
            net_amount: dec!(11000),
            kaus_amount,
            status: WithdrawalStatus::Pending,
            destination: WithdrawalDestination::Crypto {
                address: "0xabc".to_string(),
            },
            estimated_arrival: Utc::now(),
            created_at: Utc::now(),
            resolved_at: None,
            rejection_reason: None,
        }
    }

    #[tokio::test]
    async fn test_post_transaction_duplicate_key() {
        let store = InMemoryLedgerStore::new();
        let user = Uuid::new_v4();
        store.open_account(user).await.unwrap();

        let first = store.post_transaction(credit(user, dec!(100), "K1")).await.unwrap();
        let second = store.post_transaction(credit(user, dec!(100), "K1")).await.unwrap();

        assert!(first.is_applied());
        assert!(!second.is_applied());
        assert_eq!(first.transaction().id, second.transaction().id);
        assert_eq!(store.transaction_count().await, 1);
        assert_eq!(
            store.get_account(user).await.unwrap().unwrap().kaus_balance,
            dec!(100)
        );
    }

    #[tokio::test]
    async fn test_purchase_claims_its_order() {
        let store = InMemoryLedgerStore::new();
        let user = Uuid::new_v4();
        store.open_account(user).await.unwrap();
        store
            .create_order(PurchaseOrder {
                reference_id: "KAUS-TEST".to_string(),
                user_id: user,
                package_id: "starter".to_string(),
                kaus_amount: dec!(1000),
                bonus_amount: dec!(0),
                total_kaus: dec!(1000),
                price: dec!(75),
                currency: Currency::Usd,
                payment_method: crate::domain::PaymentMethod::Paypal,
                status: OrderStatus::Pending,
                transaction_id: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let first = store.post_transaction(order_payment(user, "KAUS-TEST", "K-A")).await.unwrap();
        let order = store.get_order("KAUS-TEST").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
        assert_eq!(order.transaction_id, Some(first.transaction().id));

        let err = store
            .post_transaction(order_payment(user, "KAUS-TEST", "K-B"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::OrderAlreadySettled(_)));

        // Same key replays
        let again = store
            .post_transaction(order_payment(user, "KAUS-TEST", "K-A"))
            .await
            .unwrap();
        assert!(!again.is_applied());

        assert!(store.complete_order("KAUS-TEST", first.transaction().id).await.is_ok());
        let err = store.complete_order("KAUS-TEST", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::OrderAlreadySettled(_)));

        assert_eq!(
            store.get_account(user).await.unwrap().unwrap().kaus_balance,
            dec!(1000)
        );
    }

    #[tokio::test]
    async fn test_post_transaction_unknown_account() {
        let store = InMemoryLedgerStore::new();
        let err = store
            .post_transaction(credit(Uuid::new_v4(), dec!(1), "K2"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = InMemoryLedgerStore::new();
        let user = Uuid::new_v4();
        store.open_account(user).await.unwrap();
        store.fail_postings_for(user).await;

        let err = store.post_transaction(credit(user, dec!(1), "K3")).await.unwrap_err();
        assert!(err.is_retryable());

        store.clear_failures().await;
        assert!(store.post_transaction(credit(user, dec!(1), "K3")).await.is_ok());
    }

    #[tokio::test]
    async fn test_reserve_and_complete_withdrawal() {
        let store = InMemoryLedgerStore::new();
        let user = Uuid::new_v4();
        store.open_account(user).await.unwrap();
        store.post_transaction(credit(user, dec!(500), "K4")).await.unwrap();

        let request = store.reserve_withdrawal(withdrawal(user, dec!(100))).await.unwrap();
        let account = store.get_account(user).await.unwrap().unwrap();
        assert_eq!(account.pending_kaus, dec!(100));
        assert_eq!(account.available(), dec!(400));

        let resolved = store
            .resolve_withdrawal(request.id, WithdrawalResolution::Complete)
            .await
            .unwrap();
        assert_eq!(resolved.withdrawal.status, WithdrawalStatus::Completed);
        let tx = resolved.transaction.unwrap();
        assert_eq!(tx.balance_after, dec!(400));
        assert!(tx.is_balanced());

        let account = store.get_account(user).await.unwrap().unwrap();
        assert_eq!(account.pending_kaus, dec!(0));
        assert_eq!(account.kaus_balance, dec!(400));

        let err = store
            .resolve_withdrawal(request.id, WithdrawalResolution::Complete)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidWithdrawalState { .. }));
    }

    #[tokio::test]
    async fn test_reserve_rejects_overdraft() {
        let store = InMemoryLedgerStore::new();
        let user = Uuid::new_v4();
        store.open_account(user).await.unwrap();
        store.post_transaction(credit(user, dec!(50), "K5")).await.unwrap();

        let err = store.reserve_withdrawal(withdrawal(user, dec!(51))).await.unwrap_err();
        assert!(matches!(err, StoreError::InsufficientBalance { .. }));
    }

    #[tokio::test]
    async fn test_first_purchase_flag_flips_once() {
        let store = InMemoryLedgerStore::new();
        let link = ReferralLink {
            id: Uuid::new_v4(),
            referrer_id: Uuid::new_v4(),
            referee_id: Uuid::new_v4(),
            referral_code: "F9-ABCD-1-XY".to_string(),
            signup_bonus_referrer: dec!(100),
            signup_bonus_referee: dec!(100),
            first_purchase_bonus_granted: false,
            purchase_bonus_referrer: None,
            purchase_bonus_referee: None,
            status: crate::domain::ReferralStatus::Active,
            created_at: Utc::now(),
        };
        store.insert_referral(link.clone(), 10).await.unwrap();

        assert!(store.mark_first_purchase_bonus(link.id, dec!(10), dec!(5)).await.unwrap());
        assert!(!store.mark_first_purchase_bonus(link.id, dec!(10), dec!(5)).await.unwrap());

        let err = store.insert_referral(link, 10).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateReferee(_)));
    }

    #[tokio::test]
    async fn test_insert_referral_enforces_limit() {
        let store = InMemoryLedgerStore::new();
        let referrer = Uuid::new_v4();
        let link = || ReferralLink {
            id: Uuid::new_v4(),
            referrer_id: referrer,
            referee_id: Uuid::new_v4(),
            referral_code: "F9-ABCD-1-XY".to_string(),
            signup_bonus_referrer: dec!(100),
            signup_bonus_referee: dec!(100),
            first_purchase_bonus_granted: false,
            purchase_bonus_referrer: None,
            purchase_bonus_referee: None,
            status: crate::domain::ReferralStatus::Active,
            created_at: Utc::now(),
        };

        store.insert_referral(link(), 2).await.unwrap();
        store.insert_referral(link(), 2).await.unwrap();
        let err = store.insert_referral(link(), 2).await.unwrap_err();
        assert!(matches!(err, StoreError::ReferralLimitReached(id) if id == referrer));
        assert_eq!(store.list_referrals_by_referrer(referrer).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reject_keeps_reason() {
        let store = InMemoryLedgerStore::new();
        let user = Uuid::new_v4();
        store.open_account(user).await.unwrap();
        store.post_transaction(credit(user, dec!(500), "K6")).await.unwrap();

        let request = store.reserve_withdrawal(withdrawal(user, dec!(100))).await.unwrap();
        let resolved = store
            .resolve_withdrawal(
                request.id,
                WithdrawalResolution::Reject {
                    reason: "name mismatch".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(resolved.withdrawal.status, WithdrawalStatus::Rejected);
        assert!(resolved.transaction.is_none());

        let stored = store.get_withdrawal(request.id).await.unwrap().unwrap();
        assert_eq!(stored.rejection_reason.as_deref(), Some("name mismatch"));
        assert_eq!(store.get_account(user).await.unwrap().unwrap().pending_kaus, dec!(0));
    }
}
