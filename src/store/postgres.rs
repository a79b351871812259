//! PostgreSQL Ledger Store
//!
//! Balance mutations run inside one database transaction that locks the
//! account row with `SELECT ... FOR UPDATE`. The unique index on
//! `kaus_transactions.idempotency_key` is the double-spend barrier:
//! a conflicting insert turns into `PostOutcome::Duplicate`. The partial
//! unique index on PURCHASE references keeps one credit per order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::domain::{
    AccountBalance, LedgerTransaction, PurchaseOrder, ReferralCode, ReferralLink,
    TransactionType, WithdrawalRequest, WithdrawalStatus,
};

use super::{
    withdrawal_settlement_key, LedgerStore, NewTransaction, PostOutcome, ResolvedWithdrawal,
    StoreError, WithdrawalResolution,
};

type AccountRow = (Uuid, Decimal, Decimal, Decimal, Decimal, Decimal, DateTime<Utc>);

type TransactionRow = (
    Uuid,
    Uuid,
    String,
    Decimal,
    Decimal,
    Decimal,
    String,
    String,
    bool,
    DateTime<Utc>,
);

type OrderRow = (
    String,
    Uuid,
    String,
    Decimal,
    Decimal,
    Decimal,
    Decimal,
    String,
    String,
    String,
    Option<Uuid>,
    DateTime<Utc>,
);

type ReferralRow = (
    Uuid,
    Uuid,
    Uuid,
    String,
    Decimal,
    Decimal,
    bool,
    Option<Decimal>,
    Option<Decimal>,
    String,
    DateTime<Utc>,
);

type WithdrawalRow = (
    Uuid,
    Uuid,
    Decimal,
    String,
    String,
    Decimal,
    Decimal,
    Decimal,
    String,
    serde_json::Value,
    DateTime<Utc>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<String>,
);

const ACCOUNT_COLUMNS: &str = "user_id, kaus_balance, pending_kaus, total_earnings, \
     total_deposits, total_withdrawals, updated_at";

const TRANSACTION_COLUMNS: &str = "id, user_id, type, amount, balance_before, balance_after, \
     reference_id, idempotency_key, verified, created_at";

const ORDER_COLUMNS: &str = "reference_id, user_id, package_id, kaus_amount, bonus_amount, \
     total_kaus, price, currency, payment_method, status, transaction_id, created_at";

const REFERRAL_COLUMNS: &str = "id, referrer_id, referee_id, referral_code, \
     signup_bonus_referrer, signup_bonus_referee, first_purchase_bonus_granted, \
     purchase_bonus_referrer, purchase_bonus_referee, status, created_at";

const WITHDRAWAL_COLUMNS: &str = "id, user_id, amount, currency, method, fee, net_amount, \
     kaus_amount, status, destination, estimated_arrival, created_at, resolved_at, \
     rejection_reason";

/// Partial unique index: one PURCHASE row per order reference
const PURCHASE_REFERENCE_INDEX: &str = "idx_kaus_transactions_purchase_reference";

/// Decode a TEXT column holding a serde-named enum
fn decode_enum<T: DeserializeOwned>(value: String) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::String(value.clone()))
        .map_err(|_| StoreError::Corrupt(format!("unexpected enum value: {}", value)))
}

/// Serde name of an enum variant, as stored in TEXT columns
fn encode_enum<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        _ => Err(StoreError::Corrupt("enum did not encode as a string".to_string())),
    }
}

fn account_from_row(row: AccountRow) -> AccountBalance {
    let (user_id, kaus_balance, pending_kaus, total_earnings, total_deposits, total_withdrawals, updated_at) =
        row;
    AccountBalance {
        user_id,
        kaus_balance,
        pending_kaus,
        total_earnings,
        total_deposits,
        total_withdrawals,
        updated_at,
    }
}

fn transaction_from_row(row: TransactionRow) -> Result<LedgerTransaction, StoreError> {
    let (id, user_id, kind, amount, balance_before, balance_after, reference_id, idempotency_key, verified, created_at) =
        row;
    Ok(LedgerTransaction {
        id,
        user_id,
        kind: TransactionType::try_from(kind).map_err(StoreError::Corrupt)?,
        amount,
        balance_before,
        balance_after,
        reference_id,
        idempotency_key,
        verified,
        created_at,
    })
}

fn order_from_row(row: OrderRow) -> Result<PurchaseOrder, StoreError> {
    let (
        reference_id,
        user_id,
        package_id,
        kaus_amount,
        bonus_amount,
        total_kaus,
        price,
        currency,
        payment_method,
        status,
        transaction_id,
        created_at,
    ) = row;
    Ok(PurchaseOrder {
        reference_id,
        user_id,
        package_id,
        kaus_amount,
        bonus_amount,
        total_kaus,
        price,
        currency: decode_enum(currency)?,
        payment_method: decode_enum(payment_method)?,
        status: decode_enum(status)?,
        transaction_id,
        created_at,
    })
}

fn referral_from_row(row: ReferralRow) -> Result<ReferralLink, StoreError> {
    let (
        id,
        referrer_id,
        referee_id,
        referral_code,
        signup_bonus_referrer,
        signup_bonus_referee,
        first_purchase_bonus_granted,
        purchase_bonus_referrer,
        purchase_bonus_referee,
        status,
        created_at,
    ) = row;
    Ok(ReferralLink {
        id,
        referrer_id,
        referee_id,
        referral_code,
        signup_bonus_referrer,
        signup_bonus_referee,
        first_purchase_bonus_granted,
        purchase_bonus_referrer,
        purchase_bonus_referee,
        status: decode_enum(status)?,
        created_at,
    })
}

fn withdrawal_from_row(row: WithdrawalRow) -> Result<WithdrawalRequest, StoreError> {
    let (
        id,
        user_id,
        amount,
        currency,
        method,
        fee,
        net_amount,
        kaus_amount,
        status,
        destination,
        estimated_arrival,
        created_at,
        resolved_at,
        rejection_reason,
    ) = row;
    Ok(WithdrawalRequest {
        id,
        user_id,
        amount,
        currency: decode_enum(currency)?,
        method: decode_enum(method)?,
        fee,
        net_amount,
        kaus_amount,
        status: WithdrawalStatus::try_from(status).map_err(StoreError::Corrupt)?,
        destination: serde_json::from_value(destination)
            .map_err(|e| StoreError::Corrupt(format!("withdrawal destination: {}", e)))?,
        estimated_arrival,
        created_at,
        resolved_at,
        rejection_reason,
    })
}

/// Ledger store backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lock the account row for the rest of the transaction
    async fn lock_account(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
    ) -> Result<AccountBalance, StoreError> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM kaus_accounts WHERE user_id = $1 FOR UPDATE",
            ACCOUNT_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(account_from_row)
            .ok_or(StoreError::AccountNotFound(user_id))
    }

    async fn save_account(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        account: &AccountBalance,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE kaus_accounts
            SET kaus_balance = $2,
                pending_kaus = $3,
                total_earnings = $4,
                total_deposits = $5,
                total_withdrawals = $6,
                updated_at = $7
            WHERE user_id = $1
            "#,
        )
        .bind(account.user_id)
        .bind(account.kaus_balance)
        .bind(account.pending_kaus)
        .bind(account.total_earnings)
        .bind(account.total_deposits)
        .bind(account.total_withdrawals)
        .bind(account.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Insert a transaction row; `None` when the idempotency key is taken
    async fn insert_transaction(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        row: &LedgerTransaction,
    ) -> Result<Option<Uuid>, StoreError> {
        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO kaus_transactions (
                id, user_id, type, amount, balance_before, balance_after,
                reference_id, idempotency_key, verified, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(row.id)
        .bind(row.user_id)
        .bind(row.kind.as_str())
        .bind(row.amount)
        .bind(row.balance_before)
        .bind(row.balance_after)
        .bind(&row.reference_id)
        .bind(&row.idempotency_key)
        .bind(row.verified)
        .bind(row.created_at)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.constraint() == Some(PURCHASE_REFERENCE_INDEX) => {
                StoreError::OrderAlreadySettled(row.reference_id.clone())
            }
            _ => StoreError::Database(e),
        })?;

        Ok(id)
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn open_account(&self, user_id: Uuid) -> Result<AccountBalance, StoreError> {
        let account = AccountBalance::open(user_id);
        let inserted = sqlx::query(
            r#"
            INSERT INTO kaus_accounts (
                user_id, kaus_balance, pending_kaus, total_earnings,
                total_deposits, total_withdrawals, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(account.user_id)
        .bind(account.kaus_balance)
        .bind(account.pending_kaus)
        .bind(account.total_earnings)
        .bind(account.total_deposits)
        .bind(account.total_withdrawals)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(StoreError::AccountExists(user_id));
        }
        Ok(account)
    }

    async fn get_account(&self, user_id: Uuid) -> Result<Option<AccountBalance>, StoreError> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM kaus_accounts WHERE user_id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(account_from_row))
    }

    async fn find_transaction_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<LedgerTransaction>, StoreError> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM kaus_transactions WHERE idempotency_key = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(transaction_from_row).transpose()
    }

    async fn list_transactions(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<LedgerTransaction>, StoreError> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM kaus_transactions WHERE user_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2",
            TRANSACTION_COLUMNS
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(transaction_from_row).collect()
    }

    async fn post_transaction(&self, new_tx: NewTransaction) -> Result<PostOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut account = self.lock_account(&mut tx, new_tx.user_id).await?;

        if new_tx.kind == TransactionType::Purchase {
            let settled_by: Option<String> = sqlx::query_scalar(
                r#"
                SELECT idempotency_key FROM kaus_transactions
                WHERE reference_id = $1 AND type = 'PURCHASE'
                "#,
            )
            .bind(&new_tx.reference_id)
            .fetch_optional(&mut *tx)
            .await?;

            if settled_by.is_some_and(|key| key != new_tx.idempotency_key) {
                tx.rollback().await?;
                return Err(StoreError::OrderAlreadySettled(new_tx.reference_id));
            }
        }

        if !new_tx.kind.is_credit() && account.available() < new_tx.amount {
            return Err(StoreError::InsufficientBalance {
                required: new_tx.amount,
                available: account.available(),
            });
        }

        let (balance_before, balance_after) = account.apply(new_tx.kind, new_tx.amount);
        let row = LedgerTransaction {
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

        if self.insert_transaction(&mut tx, &row).await?.is_none() {
            // Key already taken: leave the balance untouched
            tx.rollback().await?;
            let existing = self
                .find_transaction_by_idempotency_key(&row.idempotency_key)
                .await?
                .ok_or_else(|| {
                    StoreError::Corrupt(format!(
                        "idempotency key {} conflicted but no row found",
                        row.idempotency_key
                    ))
                })?;
            return Ok(PostOutcome::Duplicate(existing));
        }

        self.save_account(&mut tx, &account).await?;

        if row.kind == TransactionType::Purchase {
            sqlx::query(
                r#"
                UPDATE kaus_orders
                SET status = 'COMPLETED', transaction_id = $2
                WHERE reference_id = $1 AND status = 'PENDING'
                "#,
            )
            .bind(&row.reference_id)
            .bind(row.id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::debug!(
            "Posted {} {} for user {} ({} -> {})",
            row.kind,
            row.amount,
            row.user_id,
            row.balance_before,
            row.balance_after
        );

        Ok(PostOutcome::Applied(row))
    }

    // =========================================================================
    // Purchase orders
    // =========================================================================

    async fn create_order(&self, order: PurchaseOrder) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO kaus_orders (
                reference_id, user_id, package_id, kaus_amount, bonus_amount,
                total_kaus, price, currency, payment_method, status,
                transaction_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (reference_id) DO NOTHING
            "#,
        )
        .bind(&order.reference_id)
        .bind(order.user_id)
        .bind(&order.package_id)
        .bind(order.kaus_amount)
        .bind(order.bonus_amount)
        .bind(order.total_kaus)
        .bind(order.price)
        .bind(order.currency.as_str())
        .bind(order.payment_method.as_str())
        .bind(encode_enum(&order.status)?)
        .bind(order.transaction_id)
        .bind(order.created_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(StoreError::DuplicateOrder(order.reference_id));
        }
        Ok(())
    }

    async fn get_order(&self, reference_id: &str) -> Result<Option<PurchaseOrder>, StoreError> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            "SELECT {} FROM kaus_orders WHERE reference_id = $1",
            ORDER_COLUMNS
        ))
        .bind(reference_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(order_from_row).transpose()
    }

    async fn complete_order(
        &self,
        reference_id: &str,
        transaction_id: Uuid,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE kaus_orders
            SET status = 'COMPLETED', transaction_id = $2
            WHERE reference_id = $1
              AND (status = 'PENDING' OR transaction_id = $2)
            "#,
        )
        .bind(reference_id)
        .bind(transaction_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return match self.get_order(reference_id).await? {
                Some(_) => Err(StoreError::OrderAlreadySettled(reference_id.to_string())),
                None => Err(StoreError::OrderNotFound(reference_id.to_string())),
            };
        }
        Ok(())
    }

    // =========================================================================
    // Referrals
    // =========================================================================

    async fn find_referral_code(&self, code: &str) -> Result<Option<ReferralCode>, StoreError> {
        let row: Option<(String, Uuid, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT code, user_id, created_at
            FROM referral_codes
            WHERE UPPER(code) = UPPER($1)
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(code, user_id, created_at)| ReferralCode {
            code,
            user_id,
            created_at,
        }))
    }

    async fn find_referral_code_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Option<ReferralCode>, StoreError> {
        let row: Option<(String, Uuid, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT code, user_id, created_at
            FROM referral_codes
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(code, user_id, created_at)| ReferralCode {
            code,
            user_id,
            created_at,
        }))
    }

    async fn insert_referral_code(&self, code: ReferralCode) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO referral_codes (code, user_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&code.code)
        .bind(code.user_id)
        .bind(code.created_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(StoreError::DuplicateReferralCode(code.code));
        }
        Ok(())
    }

    async fn find_referral_by_referee(
        &self,
        referee_id: Uuid,
    ) -> Result<Option<ReferralLink>, StoreError> {
        let row: Option<ReferralRow> = sqlx::query_as(&format!(
            "SELECT {} FROM referrals WHERE referee_id = $1",
            REFERRAL_COLUMNS
        ))
        .bind(referee_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(referral_from_row).transpose()
    }

    async fn list_referrals_by_referrer(
        &self,
        referrer_id: Uuid,
    ) -> Result<Vec<ReferralLink>, StoreError> {
        let rows: Vec<ReferralRow> = sqlx::query_as(&format!(
            "SELECT {} FROM referrals WHERE referrer_id = $1 ORDER BY created_at DESC",
            REFERRAL_COLUMNS
        ))
        .bind(referrer_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(referral_from_row).collect()
    }

    async fn insert_referral(
        &self,
        link: ReferralLink,
        max_per_referrer: usize,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        // Serializes claims against one code for the count below
        sqlx::query("SELECT code FROM referral_codes WHERE user_id = $1 FOR UPDATE")
            .bind(link.referrer_id)
            .fetch_optional(&mut *tx)
            .await?;

        let taken: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM referrals WHERE referrer_id = $1")
                .bind(link.referrer_id)
                .fetch_one(&mut *tx)
                .await?;
        if taken >= max_per_referrer as i64 {
            tx.rollback().await?;
            return Err(StoreError::ReferralLimitReached(link.referrer_id));
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO referrals (
                id, referrer_id, referee_id, referral_code,
                signup_bonus_referrer, signup_bonus_referee,
                first_purchase_bonus_granted, purchase_bonus_referrer,
                purchase_bonus_referee, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (referee_id) DO NOTHING
            "#,
        )
        .bind(link.id)
        .bind(link.referrer_id)
        .bind(link.referee_id)
        .bind(&link.referral_code)
        .bind(link.signup_bonus_referrer)
        .bind(link.signup_bonus_referee)
        .bind(link.first_purchase_bonus_granted)
        .bind(link.purchase_bonus_referrer)
        .bind(link.purchase_bonus_referee)
        .bind(link.status.as_str())
        .bind(link.created_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Err(StoreError::DuplicateReferee(link.referee_id));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn mark_first_purchase_bonus(
        &self,
        referral_id: Uuid,
        referrer_bonus: Decimal,
        referee_bonus: Decimal,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE referrals
            SET first_purchase_bonus_granted = TRUE,
                purchase_bonus_referrer = $2,
                purchase_bonus_referee = $3
            WHERE id = $1 AND first_purchase_bonus_granted = FALSE
            "#,
        )
        .bind(referral_id)
        .bind(referrer_bonus)
        .bind(referee_bonus)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    // =========================================================================
    // Withdrawals
    // =========================================================================

    async fn reserve_withdrawal(
        &self,
        request: WithdrawalRequest,
    ) -> Result<WithdrawalRequest, StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut account = self.lock_account(&mut tx, request.user_id).await?;
        let available = account.available();
        if available < request.kaus_amount {
            return Err(StoreError::InsufficientBalance {
                required: request.kaus_amount,
                available,
            });
        }

        account.pending_kaus += request.kaus_amount;
        account.updated_at = Utc::now();
        self.save_account(&mut tx, &account).await?;

        let destination = serde_json::to_value(&request.destination)
            .map_err(|e| StoreError::Corrupt(format!("withdrawal destination: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO withdrawal_requests (
                id, user_id, amount, currency, method, fee, net_amount,
                kaus_amount, status, destination, estimated_arrival,
                created_at, resolved_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(request.id)
        .bind(request.user_id)
        .bind(request.amount)
        .bind(request.currency.as_str())
        .bind(request.method.as_str())
        .bind(request.fee)
        .bind(request.net_amount)
        .bind(request.kaus_amount)
        .bind(request.status.as_str())
        .bind(destination)
        .bind(request.estimated_arrival)
        .bind(request.created_at)
        .bind(request.resolved_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(request)
    }

    async fn get_withdrawal(&self, id: Uuid) -> Result<Option<WithdrawalRequest>, StoreError> {
        let row: Option<WithdrawalRow> = sqlx::query_as(&format!(
            "SELECT {} FROM withdrawal_requests WHERE id = $1",
            WITHDRAWAL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(withdrawal_from_row).transpose()
    }

    async fn resolve_withdrawal(
        &self,
        id: Uuid,
        resolution: WithdrawalResolution,
    ) -> Result<ResolvedWithdrawal, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<WithdrawalRow> = sqlx::query_as(&format!(
            "SELECT {} FROM withdrawal_requests WHERE id = $1 FOR UPDATE",
            WITHDRAWAL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let withdrawal = row
            .map(withdrawal_from_row)
            .transpose()?
            .ok_or(StoreError::WithdrawalNotFound(id))?;

        if withdrawal.status != WithdrawalStatus::Pending {
            return Err(StoreError::InvalidWithdrawalState {
                id,
                status: withdrawal.status.as_str().to_string(),
            });
        }

        let mut account = self.lock_account(&mut tx, withdrawal.user_id).await?;

        let (status, transaction) = match &resolution {
            WithdrawalResolution::Complete => {
                let (balance_before, balance_after) =
                    account.apply(TransactionType::Withdrawal, withdrawal.kaus_amount);
                let row = LedgerTransaction {
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
                if self.insert_transaction(&mut tx, &row).await?.is_none() {
                    return Err(StoreError::Corrupt(format!(
                        "withdrawal {} already settled",
                        id
                    )));
                }
                (WithdrawalStatus::Completed, Some(row))
            }
            WithdrawalResolution::Reject { .. } => {
                account.pending_kaus -= withdrawal.kaus_amount;
                account.updated_at = Utc::now();
                (WithdrawalStatus::Rejected, None)
            }
        };

        self.save_account(&mut tx, &account).await?;

        let resolved_at = Utc::now();
        let rejection_reason = match resolution {
            WithdrawalResolution::Reject { reason } => Some(reason),
            WithdrawalResolution::Complete => None,
        };
        sqlx::query(
            r#"
            UPDATE withdrawal_requests
            SET status = $2, resolved_at = $3, rejection_reason = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(resolved_at)
        .bind(rejection_reason.as_deref())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ResolvedWithdrawal {
            withdrawal: WithdrawalRequest {
                status,
                resolved_at: Some(resolved_at),
                rejection_reason,
                ..withdrawal
            },
            transaction,
        })
    }

    async fn list_pending_withdrawals_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WithdrawalRequest>, StoreError> {
        let rows: Vec<WithdrawalRow> = sqlx::query_as(&format!(
            "SELECT {} FROM withdrawal_requests \
             WHERE status = 'PENDING' AND created_at < $1 ORDER BY created_at ASC",
            WITHDRAWAL_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(withdrawal_from_row).collect()
    }
}
