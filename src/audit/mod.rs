//! Audit Log
//!
//! Append-only, tamper-evident record of every balance mutation. Each entry
//! is linked to its predecessor through a SHA-256 hash chain starting from
//! a genesis hash of 64 zeros.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Currency, OperationContext};

pub use memory::MemoryAuditLog;
pub use postgres::PgAuditLog;

/// Hash preceding the first entry of the chain
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

// =========================================================================
// Event types
// =========================================================================

/// Audited event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    KausPurchase,
    WithdrawalRequest,
    WithdrawalComplete,
    WithdrawalRejected,
    ReferralBonus,
    BalanceUpdate,
    SecurityIncident,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::KausPurchase => "KAUS_PURCHASE",
            AuditEventType::WithdrawalRequest => "WITHDRAWAL_REQUEST",
            AuditEventType::WithdrawalComplete => "WITHDRAWAL_COMPLETE",
            AuditEventType::WithdrawalRejected => "WITHDRAWAL_REJECTED",
            AuditEventType::ReferralBonus => "REFERRAL_BONUS",
            AuditEventType::BalanceUpdate => "BALANCE_UPDATE",
            AuditEventType::SecurityIncident => "SECURITY_INCIDENT",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditStatus {
    Success,
    Failed,
    Pending,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Success => "SUCCESS",
            AuditStatus::Failed => "FAILED",
            AuditStatus::Pending => "PENDING",
        }
    }
}

// =========================================================================
// Records
// =========================================================================

/// What a caller hands to the audit sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event_type: AuditEventType,
    pub user_id: Uuid,
    pub amount: Decimal,
    /// `KAUS` or a fiat code
    pub currency: String,
    pub status: AuditStatus,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    /// Record for a KAUS-denominated mutation
    pub fn kaus(event_type: AuditEventType, user_id: Uuid, amount: Decimal) -> Self {
        Self {
            event_type,
            user_id,
            amount,
            currency: "KAUS".to_string(),
            status: AuditStatus::Success,
            details: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    /// Record denominated in a fiat currency
    pub fn fiat(
        event_type: AuditEventType,
        user_id: Uuid,
        amount: Decimal,
        currency: Currency,
    ) -> Self {
        Self {
            currency: currency.as_str().to_string(),
            ..Self::kaus(event_type, user_id, amount)
        }
    }

    pub fn status(mut self, status: AuditStatus) -> Self {
        self.status = status;
        self
    }

    /// Add a key to the `details` object
    pub fn detail<T: Serialize>(mut self, key: &str, value: T) -> Self {
        if let serde_json::Value::Object(map) = &mut self.details {
            map.insert(
                key.to_string(),
                serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
            );
        }
        self
    }

    /// Attach correlation id and source from the request context
    pub fn with_context(self, context: &OperationContext) -> Self {
        let record = match context.correlation_id {
            Some(id) => self.detail("correlationId", id),
            None => self,
        };
        match &context.source {
            Some(source) => record.detail("source", source),
            None => record,
        }
    }
}

/// A record after it has been chained and stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub sequence: i64,
    #[serde(flatten)]
    pub record: AuditRecord,
    pub previous_hash: String,
    pub hash: String,
}

impl AuditEntry {
    /// Chain `record` after an entry with `previous_hash` at `sequence`.
    /// The timestamp is truncated to the microsecond precision PostgreSQL keeps.
    pub fn chain(mut record: AuditRecord, sequence: i64, previous_hash: &str) -> Self {
        record.timestamp = record.timestamp.trunc_subsecs(6);
        let hash = compute_entry_hash(previous_hash, sequence, &record);
        Self {
            id: Uuid::new_v4(),
            sequence,
            record,
            previous_hash: previous_hash.to_string(),
            hash,
        }
    }
}

/// Position in the chain up to which entries have been verified
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainCheckpoint {
    pub sequence: i64,
    pub hash: String,
}

impl ChainCheckpoint {
    /// Before the first entry
    pub fn genesis() -> Self {
        Self {
            sequence: 0,
            hash: GENESIS_HASH.to_string(),
        }
    }

    fn after(entry: &AuditEntry) -> Self {
        Self {
            sequence: entry.sequence,
            hash: entry.hash.clone(),
        }
    }
}

/// Result of hash chain verification
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainVerification {
    pub is_valid: bool,
    pub entries_checked: u64,
    pub first_invalid_entry: Option<Uuid>,
    pub expected_hash: Option<String>,
    pub actual_hash: Option<String>,
    /// Last entry accepted; the starting point when nothing was accepted
    pub checkpoint: ChainCheckpoint,
}

impl ChainVerification {
    fn valid(entries_checked: u64, checkpoint: ChainCheckpoint) -> Self {
        Self {
            is_valid: true,
            entries_checked,
            first_invalid_entry: None,
            expected_hash: None,
            actual_hash: None,
            checkpoint,
        }
    }
}

/// Audit sink errors
#[derive(Debug, thiserror::Error)]
pub enum AuditLogError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Audit log unavailable: {0}")]
    Unavailable(String),
}

/// Append-only event sink consumed by the ledger engines
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: AuditRecord) -> Result<AuditEntry, AuditLogError>;

    /// Recompute the first `limit` entries of the chain
    async fn verify_chain(&self, limit: i64) -> Result<ChainVerification, AuditLogError> {
        self.verify_chain_from(&ChainCheckpoint::genesis(), limit).await
    }

    /// Recompute up to `limit` entries after `checkpoint`. The first of
    /// them must link to the checkpoint's hash.
    async fn verify_chain_from(
        &self,
        checkpoint: &ChainCheckpoint,
        limit: i64,
    ) -> Result<ChainVerification, AuditLogError>;

    /// Newest first; all users when `user_id` is `None`
    async fn recent(&self, user_id: Option<Uuid>, limit: i64)
        -> Result<Vec<AuditEntry>, AuditLogError>;
}

// =========================================================================
// Hash chain
// =========================================================================

/// `sha256(previousHash | sequence | eventType | userId | amount | currency | status | details | timestamp)`
pub fn compute_entry_hash(previous_hash: &str, sequence: i64, record: &AuditRecord) -> String {
    let input = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}",
        previous_hash,
        sequence,
        record.event_type.as_str(),
        record.user_id,
        record.amount.normalize(),
        record.currency,
        record.status.as_str(),
        record.details,
        record.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
    );
    sha256_hex(&input)
}

/// Walk entries from the genesis hash and report the first broken link
pub fn verify_entries(entries: &[AuditEntry]) -> ChainVerification {
    verify_entries_from(&ChainCheckpoint::genesis(), entries)
}

/// Walk entries that follow `start` in sequence order
pub fn verify_entries_from(start: &ChainCheckpoint, entries: &[AuditEntry]) -> ChainVerification {
    let mut checkpoint = start.clone();

    for (checked, entry) in entries.iter().enumerate() {
        let broken = |expected: String, actual: String, checkpoint: ChainCheckpoint| {
            ChainVerification {
                is_valid: false,
                entries_checked: checked as u64 + 1,
                first_invalid_entry: Some(entry.id),
                expected_hash: Some(expected),
                actual_hash: Some(actual),
                checkpoint,
            }
        };

        if entry.previous_hash != checkpoint.hash || entry.sequence != checkpoint.sequence + 1 {
            return broken(checkpoint.hash.clone(), entry.previous_hash.clone(), checkpoint);
        }

        let calculated = compute_entry_hash(&entry.previous_hash, entry.sequence, &entry.record);
        if calculated != entry.hash {
            return broken(calculated, entry.hash.clone(), checkpoint);
        }

        checkpoint = ChainCheckpoint::after(entry);
    }

    ChainVerification::valid(entries.len() as u64, checkpoint)
}

/// Calculate SHA-256 hash and return as hex string
fn sha256_hex(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(amount: Decimal) -> AuditRecord {
        AuditRecord::kaus(AuditEventType::KausPurchase, Uuid::new_v4(), amount)
            .detail("referenceId", "KAUS-1")
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(AuditEventType::WithdrawalRejected.as_str(), "WITHDRAWAL_REJECTED");
        assert_eq!(
            serde_json::to_string(&AuditEventType::ReferralBonus).unwrap(),
            "\"REFERRAL_BONUS\""
        );
    }

    #[test]
    fn test_record_builder() {
        let context = OperationContext::new()
            .with_correlation_id(Uuid::nil())
            .with_source("webhook:paypal");
        let rec = AuditRecord::fiat(
            AuditEventType::WithdrawalRequest,
            Uuid::new_v4(),
            dec!(10000),
            Currency::Krw,
        )
        .status(AuditStatus::Pending)
        .with_context(&context);

        assert_eq!(rec.currency, "KRW");
        assert_eq!(rec.status, AuditStatus::Pending);
        assert_eq!(rec.details["source"], "webhook:paypal");
        assert!(rec.details.get("correlationId").is_some());
    }

    #[test]
    fn test_hash_is_deterministic() {
        let rec = record(dec!(100));
        let a = compute_entry_hash(GENESIS_HASH, 1, &rec);
        let b = compute_entry_hash(GENESIS_HASH, 1, &rec);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, compute_entry_hash(GENESIS_HASH, 2, &rec));
    }

    #[test]
    fn test_hash_ignores_trailing_zeros() {
        let rec = record(dec!(100));
        let padded = AuditRecord {
            amount: dec!(100.00000000),
            ..rec.clone()
        };
        assert_eq!(
            compute_entry_hash(GENESIS_HASH, 1, &rec),
            compute_entry_hash(GENESIS_HASH, 1, &padded)
        );
    }

    #[test]
    fn test_verify_detects_tampering() {
        let first = AuditEntry::chain(record(dec!(1)), 1, GENESIS_HASH);
        let second = AuditEntry::chain(record(dec!(2)), 2, &first.hash);
        let mut entries = vec![first, second];
        assert!(verify_entries(&entries).is_valid);

        entries[1].record.amount = dec!(2000);
        let result = verify_entries(&entries);
        assert!(!result.is_valid);
        assert_eq!(result.first_invalid_entry, Some(entries[1].id));
        assert_eq!(result.entries_checked, 2);
    }

    #[test]
    fn test_verify_detects_broken_link() {
        let first = AuditEntry::chain(record(dec!(1)), 1, GENESIS_HASH);
        let orphan = AuditEntry::chain(record(dec!(2)), 2, GENESIS_HASH);
        let result = verify_entries(&[first, orphan]);
        assert!(!result.is_valid);
        assert_eq!(result.expected_hash.as_ref().map(|h| h.len()), Some(64));
    }

    #[test]
    fn test_empty_chain_is_valid() {
        assert_eq!(
            verify_entries(&[]),
            ChainVerification::valid(0, ChainCheckpoint::genesis())
        );
    }

    #[test]
    fn test_verify_resumes_from_checkpoint() {
        let first = AuditEntry::chain(record(dec!(1)), 1, GENESIS_HASH);
        let second = AuditEntry::chain(record(dec!(2)), 2, &first.hash);
        let third = AuditEntry::chain(record(dec!(3)), 3, &second.hash);

        let head = verify_entries(&[first.clone()]);
        assert_eq!(head.checkpoint, ChainCheckpoint::after(&first));

        let tail = verify_entries_from(&head.checkpoint, &[second.clone(), third.clone()]);
        assert!(tail.is_valid);
        assert_eq!(tail.entries_checked, 2);
        assert_eq!(tail.checkpoint.sequence, 3);

        // A window that skips an entry does not link
        let gap = verify_entries_from(&head.checkpoint, &[third.clone()]);
        assert!(!gap.is_valid);
        assert_eq!(gap.first_invalid_entry, Some(third.id));
        assert_eq!(gap.checkpoint, head.checkpoint);
    }
}
