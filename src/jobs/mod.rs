//! Scheduled Jobs
//!
//! Periodic maintenance that runs beside the engines: rate-limiter
//! pruning, audit chain verification and the stale withdrawal report.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::interval;
use uuid::Uuid;

use crate::audit::{AuditLogError, AuditSink, ChainCheckpoint, ChainVerification};
use crate::rate_limit::RateLimiter;
use crate::store::{LedgerStore, StoreError};

// =========================================================================
// Rate limiter pruning
// =========================================================================

/// Drop rate-limit windows idle for more than two minutes
pub fn prune_rate_limiter(limiter: &RateLimiter) -> usize {
    let removed = limiter.prune(Duration::from_secs(120));
    if removed > 0 {
        tracing::info!(windows_removed = removed, "Pruned rate limit windows");
    }
    removed
}

// =========================================================================
// Audit chain verification
// =========================================================================

/// Verify up to `limit` entries after `checkpoint`
pub async fn verify_audit_chain(
    audit: &dyn AuditSink,
    checkpoint: &ChainCheckpoint,
    limit: i64,
) -> Result<ChainVerification, JobError> {
    let verification = audit.verify_chain_from(checkpoint, limit).await?;

    if verification.is_valid {
        tracing::debug!(
            entries_checked = verification.entries_checked,
            verified_through = verification.checkpoint.sequence,
            "Audit chain verified"
        );
    } else {
        tracing::error!(
            alert = "audit_chain_broken",
            first_invalid_entry = ?verification.first_invalid_entry,
            expected_hash = ?verification.expected_hash,
            actual_hash = ?verification.actual_hash,
            "Audit chain verification failed"
        );
    }

    Ok(verification)
}

// =========================================================================
// Stale withdrawals
// =========================================================================

/// Ids of PENDING withdrawals created more than `max_age_hours` ago
pub async fn report_stale_withdrawals(
    store: &dyn LedgerStore,
    max_age_hours: i64,
) -> Result<Vec<Uuid>, JobError> {
    let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours);
    let stale = store.list_pending_withdrawals_before(cutoff).await?;

    for withdrawal in &stale {
        tracing::warn!(
            withdrawal_id = %withdrawal.id,
            user_id = %withdrawal.user_id,
            created_at = %withdrawal.created_at,
            kaus_amount = %withdrawal.kaus_amount,
            "Withdrawal still pending"
        );
    }

    Ok(stale.into_iter().map(|w| w.id).collect())
}

// =========================================================================
// Job Scheduler
// =========================================================================

/// Configuration for job scheduler
#[derive(Debug, Clone)]
pub struct JobSchedulerConfig {
    /// Interval for rate limit pruning (default: 1 minute)
    pub rate_limit_prune_interval: Duration,
    /// Interval for audit chain verification (default: 10 minutes)
    pub audit_verify_interval: Duration,
    /// Entries checked per verification run, continuing from the last
    /// verified entry
    pub audit_verify_limit: i64,
    /// Interval for the stale withdrawal report (default: 1 hour)
    pub stale_withdrawal_interval: Duration,
    pub stale_withdrawal_hours: i64,
}

impl Default for JobSchedulerConfig {
    fn default() -> Self {
        Self {
            rate_limit_prune_interval: Duration::from_secs(60),
            audit_verify_interval: Duration::from_secs(600),
            audit_verify_limit: 10_000,
            stale_withdrawal_interval: Duration::from_secs(3600),
            stale_withdrawal_hours: 72,
        }
    }
}

/// Job Scheduler - runs periodic maintenance tasks
pub struct JobScheduler {
    store: Arc<dyn LedgerStore>,
    audit: Arc<dyn AuditSink>,
    limiter: Arc<RateLimiter>,
    config: JobSchedulerConfig,
    /// Last audit entry verified; restarts from genesis with the process
    audit_checkpoint: Mutex<ChainCheckpoint>,
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        audit: Arc<dyn AuditSink>,
        limiter: Arc<RateLimiter>,
        config: JobSchedulerConfig,
    ) -> Self {
        Self {
            store,
            audit,
            limiter,
            config,
            audit_checkpoint: Mutex::new(ChainCheckpoint::genesis()),
        }
    }

    pub async fn audit_checkpoint(&self) -> ChainCheckpoint {
        self.audit_checkpoint.lock().await.clone()
    }

    /// Verify the next window of the audit chain. The checkpoint only
    /// moves past entries that verified.
    async fn verify_audit_window(&self) -> Result<ChainVerification, JobError> {
        let mut checkpoint = self.audit_checkpoint.lock().await;
        let verification =
            verify_audit_chain(self.audit.as_ref(), &checkpoint, self.config.audit_verify_limit)
                .await?;
        if verification.is_valid {
            *checkpoint = verification.checkpoint.clone();
        }
        Ok(verification)
    }

    /// Start the job scheduler in the background
    /// Returns a handle that can be used to abort the scheduler
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        tracing::info!("Job scheduler started");

        let mut prune_interval = interval(self.config.rate_limit_prune_interval);
        let mut audit_interval = interval(self.config.audit_verify_interval);
        let mut withdrawal_interval = interval(self.config.stale_withdrawal_interval);

        loop {
            tokio::select! {
                _ = prune_interval.tick() => {
                    prune_rate_limiter(&self.limiter);
                }
                _ = audit_interval.tick() => {
                    if let Err(e) = self.verify_audit_window().await {
                        tracing::error!(error = %e, "Audit chain verification job failed");
                    }
                }
                _ = withdrawal_interval.tick() => {
                    if let Err(e) = report_stale_withdrawals(self.store.as_ref(), self.config.stale_withdrawal_hours).await {
                        tracing::error!(error = %e, "Stale withdrawal report failed");
                    }
                }
            }
        }
    }

    /// Run all maintenance jobs once (for manual trigger or testing)
    pub async fn run_all_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport {
            rate_limit_windows_pruned: prune_rate_limiter(&self.limiter),
            ..MaintenanceReport::default()
        };

        match self.verify_audit_window().await {
            Ok(verification) => report.audit_chain_valid = Some(verification.is_valid),
            Err(e) => report.errors.push(format!("Audit verification: {}", e)),
        }

        match report_stale_withdrawals(self.store.as_ref(), self.config.stale_withdrawal_hours).await {
            Ok(ids) => report.stale_withdrawals = ids,
            Err(e) => report.errors.push(format!("Stale withdrawals: {}", e)),
        }

        report.completed_at = Utc::now();
        report
    }
}

/// Report from running maintenance jobs
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub rate_limit_windows_pruned: usize,
    pub audit_chain_valid: Option<bool>,
    pub stale_withdrawals: Vec<Uuid>,
    pub errors: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// Job execution errors
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Audit log error: {0}")]
    Audit(#[from] AuditLogError),
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, AuditRecord, MemoryAuditLog};
    use crate::domain::{
        Currency, WithdrawalDestination, WithdrawalMethod, WithdrawalRequest, WithdrawalStatus,
    };
    use crate::store::{InMemoryLedgerStore, NewTransaction};
    use crate::domain::TransactionType;
    use rust_decimal_macros::dec;

    #[test]
    fn test_job_scheduler_config_default() {
        let config = JobSchedulerConfig::default();
        assert_eq!(config.rate_limit_prune_interval, Duration::from_secs(60));
        assert_eq!(config.audit_verify_interval, Duration::from_secs(600));
        assert_eq!(config.stale_withdrawal_hours, 72);
    }

    #[test]
    fn test_maintenance_report_default() {
        let report = MaintenanceReport::default();
        assert_eq!(report.rate_limit_windows_pruned, 0);
        assert!(report.audit_chain_valid.is_none());
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_run_all_once() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let audit = Arc::new(MemoryAuditLog::new());
        let user = Uuid::new_v4();
        store.open_account(user).await.unwrap();
        store
            .post_transaction(NewTransaction {
                user_id: user,
                kind: TransactionType::Purchase,
                amount: dec!(1000),
                reference_id: "KAUS-1".to_string(),
                idempotency_key: "CAP-JOB".to_string(),
            })
            .await
            .unwrap();

        let old = Utc::now() - chrono::Duration::hours(100);
        store
            .reserve_withdrawal(WithdrawalRequest {
                id: Uuid::new_v4(),
                user_id: user,
                amount: dec!(12000),
                currency: Currency::Krw,
                method: WithdrawalMethod::Crypto,
                fee: dec!(12),
                net_amount: dec!(11988),
                kaus_amount: dec!(100),
                status: WithdrawalStatus::Pending,
                destination: WithdrawalDestination::Crypto {
                    address: "0xabc".to_string(),
                },
                estimated_arrival: old,
                created_at: old,
                resolved_at: None,
                rejection_reason: None,
            })
            .await
            .unwrap();

        audit
            .append(AuditRecord::kaus(AuditEventType::KausPurchase, user, dec!(1000)))
            .await
            .unwrap();

        let scheduler = JobScheduler::new(
            store,
            audit,
            Arc::new(RateLimiter::new()),
            JobSchedulerConfig::default(),
        );
        let report = scheduler.run_all_once().await;

        assert!(report.errors.is_empty());
        assert_eq!(report.audit_chain_valid, Some(true));
        assert_eq!(report.stale_withdrawals.len(), 1);
    }

    #[tokio::test]
    async fn test_audit_verification_walks_the_whole_chain() {
        let audit = Arc::new(MemoryAuditLog::new());
        for _ in 0..25 {
            audit
                .append(AuditRecord::kaus(AuditEventType::KausPurchase, Uuid::nil(), dec!(1)))
                .await
                .unwrap();
        }

        let scheduler = JobScheduler::new(
            Arc::new(InMemoryLedgerStore::new()),
            audit.clone(),
            Arc::new(RateLimiter::new()),
            JobSchedulerConfig {
                audit_verify_limit: 10,
                ..JobSchedulerConfig::default()
            },
        );

        for expected in [10, 20, 25, 25] {
            let report = scheduler.run_all_once().await;
            assert_eq!(report.audit_chain_valid, Some(true));
            assert_eq!(scheduler.audit_checkpoint().await.sequence, expected);
        }

        // New entries are picked up on the next run
        audit
            .append(AuditRecord::kaus(AuditEventType::BalanceUpdate, Uuid::nil(), dec!(2)))
            .await
            .unwrap();
        scheduler.run_all_once().await;
        let checkpoint = scheduler.audit_checkpoint().await;
        assert_eq!(checkpoint.sequence, 26);
        assert_eq!(checkpoint.hash, audit.entries().await[25].hash);
    }

    #[tokio::test]
    async fn test_unavailable_audit_is_reported() {
        let audit = Arc::new(MemoryAuditLog::new());
        audit.set_unavailable(true);
        let scheduler = JobScheduler::new(
            Arc::new(InMemoryLedgerStore::new()),
            audit,
            Arc::new(RateLimiter::new()),
            JobSchedulerConfig::default(),
        );
        let report = scheduler.run_all_once().await;
        assert_eq!(report.errors.len(), 1);
        assert!(report.audit_chain_valid.is_none());
    }
}
