//! Configuration module
//!
//! Loads configuration from environment variables.

use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

/// Amounts and limits of the referral program
#[derive(Debug, Clone, PartialEq)]
pub struct ReferralPolicy {
    /// KAUS credited to the referrer on signup
    pub signup_bonus_referrer: Decimal,
    /// KAUS credited to the referee on signup
    pub signup_bonus_referee: Decimal,
    /// Percent of the first purchase credited to the referrer
    pub purchase_bonus_referrer_pct: Decimal,
    /// Percent of the first purchase credited to the referee
    pub purchase_bonus_referee_pct: Decimal,
    pub max_referrals: usize,
}

impl Default for ReferralPolicy {
    fn default() -> Self {
        Self {
            signup_bonus_referrer: Decimal::from(100),
            signup_bonus_referee: Decimal::from(100),
            purchase_bonus_referrer_pct: Decimal::from(10),
            purchase_bonus_referee_pct: Decimal::from(5),
            max_referrals: 1000,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Environment (development, production)
    pub environment: String,

    /// Rate limit: requests per minute per client on the public API
    pub rate_limit_per_minute: u32,

    /// Rate limit for payment provider webhooks
    pub webhook_rate_limit_per_minute: u32,

    pub log_format: LogFormat,

    pub referral: ReferralPolicy,

    /// PENDING withdrawals older than this are reported by the maintenance job
    pub stale_withdrawal_hours: i64,
}

/// Read `name`, falling back to `default`, and parse it
fn parse_env<T: FromStr>(name: &'static str, default: &str) -> Result<T, ConfigError> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(name))
}

/// Like `parse_env`, rejecting negative amounts
fn parse_amount(name: &'static str, default: &str) -> Result<Decimal, ConfigError> {
    let value: Decimal = parse_env(name, default)?;
    if value.is_sign_negative() {
        return Err(ConfigError::InvalidValue(name));
    }
    Ok(value)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnv("DATABASE_URL"))?;

        let log_format = match env::var("LOG_FORMAT")
            .unwrap_or_else(|_| "pretty".to_string())
            .to_lowercase()
            .as_str()
        {
            "pretty" => LogFormat::Pretty,
            "json" => LogFormat::Json,
            _ => return Err(ConfigError::InvalidValue("LOG_FORMAT")),
        };

        let referral = ReferralPolicy {
            signup_bonus_referrer: parse_amount("REFERRAL_SIGNUP_BONUS_REFERRER", "100")?,
            signup_bonus_referee: parse_amount("REFERRAL_SIGNUP_BONUS_REFEREE", "100")?,
            purchase_bonus_referrer_pct: parse_amount("REFERRAL_PURCHASE_BONUS_REFERRER_PCT", "10")?,
            purchase_bonus_referee_pct: parse_amount("REFERRAL_PURCHASE_BONUS_REFEREE_PCT", "5")?,
            max_referrals: parse_env("REFERRAL_MAX_PER_REFERRER", "1000")?,
        };

        let stale_withdrawal_hours: i64 = parse_env("STALE_WITHDRAWAL_HOURS", "72")?;
        if stale_withdrawal_hours <= 0 {
            return Err(ConfigError::InvalidValue("STALE_WITHDRAWAL_HOURS"));
        }

        Ok(Self {
            database_url,
            database_max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10")?,
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_env("PORT", "3000")?,
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            rate_limit_per_minute: parse_env("RATE_LIMIT_PER_MINUTE", "100")?,
            webhook_rate_limit_per_minute: parse_env("WEBHOOK_RATE_LIMIT_PER_MINUTE", "1000")?,
            log_format,
            referral,
            stale_withdrawal_hours,
        })
    }

    /// Configuration for tests and local tooling; no database is contacted
    pub fn for_local() -> Self {
        Self {
            database_url: String::new(),
            database_max_connections: 1,
            host: "127.0.0.1".to_string(),
            port: 0,
            environment: "test".to_string(),
            rate_limit_per_minute: 100,
            webhook_rate_limit_per_minute: 1000,
            log_format: LogFormat::Pretty,
            referral: ReferralPolicy::default(),
            stale_withdrawal_hours: 72,
        }
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_referral_policy() {
        let policy = ReferralPolicy::default();
        assert_eq!(policy.signup_bonus_referrer, dec!(100));
        assert_eq!(policy.signup_bonus_referee, dec!(100));
        assert_eq!(policy.purchase_bonus_referrer_pct, dec!(10));
        assert_eq!(policy.purchase_bonus_referee_pct, dec!(5));
        assert_eq!(policy.max_referrals, 1000);
    }

    #[test]
    fn test_parse_env_default_and_invalid() {
        let port: u16 = parse_env("KAUS_TEST_UNSET_PORT", "3000").unwrap();
        assert_eq!(port, 3000);

        let err = parse_env::<u16>("KAUS_TEST_UNSET_BAD", "not-a-number").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue("KAUS_TEST_UNSET_BAD")));
    }

    #[test]
    fn test_parse_amount_rejects_negative() {
        assert!(parse_amount("KAUS_TEST_UNSET_AMOUNT", "-1").is_err());
        assert_eq!(parse_amount("KAUS_TEST_UNSET_AMOUNT", "2.5").unwrap(), dec!(2.5));
    }
}
