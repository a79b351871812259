//! Rate Limiter
//!
//! In-process fixed-window counters keyed by `(identifier, endpoint)`.
//! One instance is built at startup and shared through application state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Limits of one endpoint class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window: Duration,
    /// Requests are refused for this long once the limit is exceeded
    pub block_duration: Option<Duration>,
}

impl RateLimitPolicy {
    /// General API traffic
    pub fn standard(max_requests: u32) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(60),
            block_duration: None,
        }
    }

    /// Purchases and withdrawals
    pub fn payment() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(60),
            block_duration: Some(Duration::from_secs(10 * 60)),
        }
    }

    /// Payment provider callbacks
    pub fn webhook(max_requests: u32) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(60),
            block_duration: None,
        }
    }
}

/// Outcome of a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Time until the client may retry; zero when allowed
    pub retry_after: Duration,
    pub blocked: bool,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
    blocked_until: Option<Instant>,
}

/// Fixed-window rate limiter
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<(String, String), Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request of `identifier` against `endpoint`
    pub fn check(&self, identifier: &str, endpoint: &str, policy: RateLimitPolicy) -> RateLimitDecision {
        self.check_at(identifier, endpoint, policy, Instant::now())
    }

    pub fn check_at(
        &self,
        identifier: &str,
        endpoint: &str,
        policy: RateLimitPolicy,
        now: Instant,
    ) -> RateLimitDecision {
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let window = windows
            .entry((identifier.to_string(), endpoint.to_string()))
            .or_insert(Window {
                started: now,
                count: 0,
                blocked_until: None,
            });

        if let Some(until) = window.blocked_until {
            if until > now {
                return RateLimitDecision {
                    allowed: false,
                    remaining: 0,
                    retry_after: until - now,
                    blocked: true,
                };
            }
            window.blocked_until = None;
            window.started = now;
            window.count = 0;
        }

        if now.duration_since(window.started) >= policy.window {
            window.started = now;
            window.count = 0;
        }

        if window.count >= policy.max_requests {
            let retry_after = match policy.block_duration {
                Some(block) => {
                    window.blocked_until = Some(now + block);
                    block
                }
                None => policy.window.saturating_sub(now.duration_since(window.started)),
            };
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                retry_after,
                blocked: policy.block_duration.is_some(),
            };
        }

        window.count += 1;
        RateLimitDecision {
            allowed: true,
            remaining: policy.max_requests - window.count,
            retry_after: Duration::ZERO,
            blocked: false,
        }
    }

    /// Drop windows older than `max_age` that are not blocking anyone.
    /// Returns how many were removed.
    pub fn prune(&self, max_age: Duration) -> usize {
        self.prune_at(max_age, Instant::now())
    }

    pub fn prune_at(&self, max_age: Duration, now: Instant) -> usize {
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = windows.len();
        windows.retain(|_, w| {
            let blocking = w.blocked_until.is_some_and(|until| until > now);
            blocking || now.duration_since(w.started) < max_age
        });
        before - windows.len()
    }

    pub fn tracked(&self) -> usize {
        match self.windows.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}
