//! Idempotency module
//!
//! Prevents a payment event or referral claim from being applied more
//! than once. The store's unique index on the idempotency key is the
//! real barrier; the guard is the cheap pre-check in front of it.

mod guard;

pub use guard::{validate_key, IdempotencyGuard, MAX_KEY_LENGTH};
