//! Amount type
//!
//! Domain primitive for KAUS and fiat amounts entering the ledger.
//! Every amount is passed through `round8` at construction time, so an
//! `Amount` is always positive and carries exactly 8 fractional digits.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::precision::{add8, round8};

/// Maximum allowed amount (1 trillion)
const MAX_AMOUNT: Decimal = Decimal::from_parts(3_567_587_328, 232, 0, false, 0);

/// Amount represents a validated, rounded monetary value.
///
/// # Invariants
/// - Value is always positive (> 0) after rounding
/// - Exactly 8 decimal places
/// - Maximum value is 1 trillion
///
/// # Example
/// ```
/// use rust_decimal::Decimal;
/// use kaus_ledger::domain::Amount;
///
/// let amount = Amount::new(Decimal::new(100, 0)).unwrap();
/// assert_eq!(amount.to_string(), "100.00000000");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Amount(Decimal);

/// Errors that can occur when creating an Amount
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("Amount must be positive (got {0})")]
    NotPositive(Decimal),

    #[error("Amount exceeds maximum allowed value ({MAX_AMOUNT})")]
    Overflow,

    #[error("Invalid amount format: {0}")]
    ParseError(String),
}

impl Amount {
    /// Create a new Amount, rounding to 8 fractional digits first.
    ///
    /// # Errors
    /// - `AmountError::NotPositive` if the rounded value is <= 0
    /// - `AmountError::Overflow` if value > 1 trillion
    pub fn new(value: Decimal) -> Result<Self, AmountError> {
        let value = round8(value);

        if value <= Decimal::ZERO {
            return Err(AmountError::NotPositive(value));
        }

        if value > MAX_AMOUNT {
            return Err(AmountError::Overflow);
        }

        Ok(Self(value))
    }

    /// Create an Amount from an integer (no decimal places).
    pub fn from_integer(value: i64) -> Result<Self, AmountError> {
        Self::new(Decimal::from(value))
    }

    /// Get the underlying Decimal value.
    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Checked, rounded addition.
    pub fn try_add(&self, other: &Amount) -> Result<Amount, AmountError> {
        Amount::new(add8(self.0, other.0))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.8}", self.0)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decimal = Decimal::from_str(s.trim())
            .map_err(|e| AmountError::ParseError(e.to_string()))?;
        Amount::new(decimal)
    }
}

impl TryFrom<String> for Amount {
    type Error = AmountError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Amount::from_str(&value)
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = AmountError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Amount::new(value)
    }
}

impl From<Amount> for String {
    fn from(amount: Amount) -> Self {
        format!("{:.8}", amount.0)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_amount_positive() {
        let amount = Amount::new(dec!(100)).unwrap();
        assert_eq!(amount.value(), dec!(100));
        assert_eq!(amount.value().scale(), 8);
    }

    #[test]
    fn test_amount_zero_rejected() {
        assert!(matches!(Amount::new(Decimal::ZERO), Err(AmountError::NotPositive(_))));
    }

    #[test]
    fn test_amount_negative_rejected() {
        assert!(matches!(Amount::new(dec!(-100)), Err(AmountError::NotPositive(_))));
    }

    #[test]
    fn test_amount_rounds_extra_decimals() {
        let amount = Amount::new(dec!(0.123456785)).unwrap();
        assert_eq!(amount.value(), dec!(0.12345679));
    }

    #[test]
    fn test_amount_rounding_to_zero_rejected() {
        // 0.000000004 rounds to 0.00000000
        assert!(matches!(
            Amount::new(dec!(0.000000004)),
            Err(AmountError::NotPositive(_))
        ));
    }

    #[test]
    fn test_amount_overflow() {
        assert_eq!(MAX_AMOUNT, dec!(1000000000000));
        assert!(matches!(Amount::new(dec!(1000000000001)), Err(AmountError::Overflow)));
        assert!(Amount::new(dec!(1000000000000)).is_ok());
    }

    #[test]
    fn test_amount_from_str() {
        let amount: Amount = "500.12345678".parse().unwrap();
        assert_eq!(amount.value(), dec!(500.12345678));
        assert!("abc".parse::<Amount>().is_err());
    }

    #[test]
    fn test_amount_serde_as_string() {
        let amount = Amount::from_integer(10).unwrap();
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"10.00000000\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);
    }

    #[test]
    fn test_amount_try_add() {
        let a = Amount::new(dec!(0.1)).unwrap();
        let b = Amount::new(dec!(0.2)).unwrap();
        assert_eq!(a.try_add(&b).unwrap().to_string(), "0.30000000");
    }
}
