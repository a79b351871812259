//! Idempotency Guard

use std::sync::Arc;

use crate::domain::{LedgerError, LedgerTransaction};
use crate::store::LedgerStore;

/// Longest accepted idempotency key
pub const MAX_KEY_LENGTH: usize = 255;

/// Keys are 1..=255 characters of `[A-Za-z0-9_-]`
pub fn validate_key(key: &str) -> Result<(), LedgerError> {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(LedgerError::InvalidIdempotencyKey(format!(
            "length must be between 1 and {}",
            MAX_KEY_LENGTH
        )));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(LedgerError::InvalidIdempotencyKey(
            "only letters, digits, '-' and '_' are allowed".to_string(),
        ));
    }
    Ok(())
}

/// Consults the ledger store for an already-recorded transaction
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn LedgerStore>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// The transaction previously recorded under `key`, if any
    pub async fn lookup(&self, key: &str) -> Result<Option<LedgerTransaction>, LedgerError> {
        validate_key(key)?;
        Ok(self.store.find_transaction_by_idempotency_key(key).await?)
    }

    pub async fn is_already_processed(&self, key: &str) -> Result<bool, LedgerError> {
        Ok(self.lookup(key).await?.is_some())
    }
}
