//! In-memory audit sink

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    verify_entries_from, AuditEntry, AuditLogError, AuditRecord, AuditSink, ChainCheckpoint,
    ChainVerification, GENESIS_HASH,
};

/// Audit log kept in process memory, with an availability switch for tests
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
    unavailable: AtomicBool,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }

    fn check_available(&self) -> Result<(), AuditLogError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AuditLogError::Unavailable("audit sink offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn append(&self, record: AuditRecord) -> Result<AuditEntry, AuditLogError> {
        self.check_available()?;

        let mut entries = self.entries.lock().await;
        let (sequence, previous_hash) = entries
            .last()
            .map(|e| (e.sequence + 1, e.hash.clone()))
            .unwrap_or((1, GENESIS_HASH.to_string()));

        let entry = AuditEntry::chain(record, sequence, &previous_hash);
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn verify_chain_from(
        &self,
        checkpoint: &ChainCheckpoint,
        limit: i64,
    ) -> Result<ChainVerification, AuditLogError> {
        self.check_available()?;
        let entries = self.entries.lock().await;
        let window: Vec<AuditEntry> = entries
            .iter()
            .filter(|e| e.sequence > checkpoint.sequence)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        Ok(verify_entries_from(checkpoint, &window))
    }

    async fn recent(
        &self,
        user_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<AuditEntry>, AuditLogError> {
        self.check_available()?;
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .rev()
            .filter(|e| user_id.map_or(true, |u| e.record.user_id == u))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEventType;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_append_links_entries() {
        let log = MemoryAuditLog::new();
        let user = Uuid::new_v4();

        let first = log
            .append(AuditRecord::kaus(AuditEventType::KausPurchase, user, dec!(100)))
            .await
            .unwrap();
        let second = log
            .append(AuditRecord::kaus(AuditEventType::ReferralBonus, user, dec!(10)))
            .await
            .unwrap();

        assert_eq!(first.previous_hash, GENESIS_HASH);
        assert_eq!(second.previous_hash, first.hash);
        assert_eq!(second.sequence, 2);
        assert!(log.verify_chain(100).await.unwrap().is_valid);
    }

    #[tokio::test]
    async fn test_tampering_past_first_window_is_found() {
        let log = MemoryAuditLog::new();
        for i in 1..=25 {
            log.append(AuditRecord::kaus(
                AuditEventType::KausPurchase,
                Uuid::nil(),
                Decimal::from(i),
            ))
            .await
            .unwrap();
        }
        log.entries.lock().await[21].record.amount = dec!(5000);

        // The first window alone looks clean
        let head = log.verify_chain(10).await.unwrap();
        assert!(head.is_valid);
        assert_eq!(head.checkpoint.sequence, 10);

        let middle = log.verify_chain_from(&head.checkpoint, 10).await.unwrap();
        assert!(middle.is_valid);
        assert_eq!(middle.checkpoint.sequence, 20);

        let tail = log.verify_chain_from(&middle.checkpoint, 10).await.unwrap();
        assert!(!tail.is_valid);
        assert_eq!(tail.entries_checked, 2);
        assert_eq!(tail.checkpoint.sequence, 21);
    }

    #[tokio::test]
    async fn test_unavailable_sink() {
        let log = MemoryAuditLog::new();
        log.set_unavailable(true);
        let err = log
            .append(AuditRecord::kaus(AuditEventType::BalanceUpdate, Uuid::nil(), dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, AuditLogError::Unavailable(_)));
        assert!(log.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_recent_filters_by_user() {
        let log = MemoryAuditLog::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        for (user, amount) in [(alice, dec!(1)), (bob, dec!(2)), (alice, dec!(3))] {
            log.append(AuditRecord::kaus(AuditEventType::KausPurchase, user, amount))
                .await
                .unwrap();
        }

        let recent = log.recent(Some(alice), 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].record.amount, dec!(3));
        assert_eq!(log.recent(None, 2).await.unwrap().len(), 2);
    }
}
