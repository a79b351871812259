//! PostgreSQL audit sink
//!
//! The chain is extended inside a transaction holding an advisory lock, so
//! concurrent appends see a consistent tail.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    verify_entries_from, AuditEntry, AuditLogError, AuditRecord, AuditSink, ChainCheckpoint,
    ChainVerification, GENESIS_HASH,
};

/// Advisory lock key serializing appends to `audit_logs`
const AUDIT_CHAIN_LOCK: i64 = 0x4b41_5553_4155_4454;

type AuditRow = (
    Uuid,
    i64,
    String,
    Uuid,
    Decimal,
    String,
    String,
    serde_json::Value,
    DateTime<Utc>,
    String,
    String,
);

const AUDIT_COLUMNS: &str = "id, sequence_number, event_type, user_id, amount, currency, \
     status, details, event_timestamp, previous_hash, current_hash";

fn entry_from_row(row: AuditRow) -> Result<AuditEntry, AuditLogError> {
    let (
        id,
        sequence,
        event_type,
        user_id,
        amount,
        currency,
        status,
        details,
        timestamp,
        previous_hash,
        hash,
    ) = row;
    Ok(AuditEntry {
        id,
        sequence,
        record: AuditRecord {
            event_type: serde_json::from_value(serde_json::Value::String(event_type))?,
            user_id,
            amount,
            currency,
            status: serde_json::from_value(serde_json::Value::String(status))?,
            details,
            timestamp,
        },
        previous_hash,
        hash,
    })
}

/// Audit Log backed by the `audit_logs` table
#[derive(Debug, Clone)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditLog {
    async fn append(&self, record: AuditRecord) -> Result<AuditEntry, AuditLogError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(AUDIT_CHAIN_LOCK)
            .execute(&mut *tx)
            .await?;

        let tail: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT sequence_number, current_hash
            FROM audit_logs
            ORDER BY sequence_number DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let (sequence, previous_hash) = tail
            .map(|(seq, hash)| (seq + 1, hash))
            .unwrap_or((1, GENESIS_HASH.to_string()));

        let entry = AuditEntry::chain(record, sequence, &previous_hash);

        sqlx::query(
            r#"
            INSERT INTO audit_logs (
                id, sequence_number, event_type, user_id, amount, currency,
                status, details, event_timestamp, previous_hash, current_hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(entry.id)
        .bind(entry.sequence)
        .bind(entry.record.event_type.as_str())
        .bind(entry.record.user_id)
        .bind(entry.record.amount)
        .bind(&entry.record.currency)
        .bind(entry.record.status.as_str())
        .bind(&entry.record.details)
        .bind(entry.record.timestamp)
        .bind(&entry.previous_hash)
        .bind(&entry.hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            audit_id = %entry.id,
            event_type = %entry.record.event_type,
            sequence = entry.sequence,
            "Audit log entry created"
        );

        Ok(entry)
    }

    async fn verify_chain_from(
        &self,
        checkpoint: &ChainCheckpoint,
        limit: i64,
    ) -> Result<ChainVerification, AuditLogError> {
        let rows: Vec<AuditRow> = sqlx::query_as(&format!(
            "SELECT {} FROM audit_logs WHERE sequence_number > $1 \
             ORDER BY sequence_number ASC LIMIT $2",
            AUDIT_COLUMNS
        ))
        .bind(checkpoint.sequence)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let entries = rows
            .into_iter()
            .map(entry_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(verify_entries_from(checkpoint, &entries))
    }

    async fn recent(
        &self,
        user_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<AuditEntry>, AuditLogError> {
        let rows: Vec<AuditRow> = sqlx::query_as(&format!(
            "SELECT {} FROM audit_logs \
             WHERE ($1::uuid IS NULL OR user_id = $1) \
             ORDER BY sequence_number DESC LIMIT $2",
            AUDIT_COLUMNS
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(entry_from_row).collect()
    }
}
