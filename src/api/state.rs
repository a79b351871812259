//! Shared application state

use std::sync::Arc;

use crate::audit::AuditSink;
use crate::config::Config;
use crate::handlers::{PurchaseHandler, ReferralHandler, SettlementHandler, WithdrawalHandler};
use crate::rate_limit::RateLimiter;
use crate::store::LedgerStore;

/// Engines and collaborators handed to every route
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub audit: Arc<dyn AuditSink>,
    pub settlement: SettlementHandler,
    pub referrals: ReferralHandler,
    pub withdrawals: WithdrawalHandler,
    pub purchases: PurchaseHandler,
    pub limiter: Arc<RateLimiter>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(store: Arc<dyn LedgerStore>, audit: Arc<dyn AuditSink>, config: Config) -> Self {
        let settlement = SettlementHandler::new(store.clone(), audit.clone());
        let referrals = ReferralHandler::new(store.clone(), audit.clone(), config.referral.clone());
        let withdrawals = WithdrawalHandler::new(store.clone(), audit.clone());
        let purchases = PurchaseHandler::new(
            store.clone(),
            audit.clone(),
            settlement.clone(),
            referrals.clone(),
        );

        Self {
            store,
            audit,
            settlement,
            referrals,
            withdrawals,
            purchases,
            limiter: Arc::new(RateLimiter::new()),
            config: Arc::new(config),
        }
    }
}
