//! Precision Engine
//!
//! Fixed-point rounding for every monetary value in the ledger.
//! Values are kept as `rust_decimal::Decimal` and normalized to exactly
//! eight fractional digits, rounding half away from zero.

use rust_decimal::{Decimal, RoundingStrategy};

/// Number of fractional digits kept for every monetary value
pub const DECIMAL_PRECISION: u32 = 8;

/// Round a value to 8 fractional digits (half away from zero).
///
/// The result always carries a scale of exactly 8, so `to_string()`
/// renders `0.30000000` rather than `0.3`.
///
/// # Example
/// ```
/// use rust_decimal::Decimal;
/// use std::str::FromStr;
/// use kaus_ledger::domain::round8;
///
/// let x = Decimal::from_str("0.1").unwrap() + Decimal::from_str("0.2").unwrap();
/// assert_eq!(round8(x).to_string(), "0.30000000");
/// ```
pub fn round8(value: Decimal) -> Decimal {
    let mut rounded =
        value.round_dp_with_strategy(DECIMAL_PRECISION, RoundingStrategy::MidpointAwayFromZero);
    // Already at most 8 dp, so this only pads trailing zeros.
    rounded.rescale(DECIMAL_PRECISION);
    rounded
}

/// `round8(a + b)`
pub fn add8(a: Decimal, b: Decimal) -> Decimal {
    round8(a + b)
}

/// `round8(a - b)`
pub fn sub8(a: Decimal, b: Decimal) -> Decimal {
    round8(a - b)
}

/// `round8(amount * pct / 100)`
pub fn percent_of(amount: Decimal, pct: Decimal) -> Decimal {
    round8(amount * pct / Decimal::ONE_HUNDRED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round8_no_float_drift() {
        let sum = dec!(0.1) + dec!(0.2);
        assert_eq!(round8(sum), dec!(0.3));
        assert_eq!(round8(sum).to_string(), "0.30000000");
    }

    #[test]
    fn test_round8_half_away_from_zero() {
        assert_eq!(round8(dec!(1.000000005)), dec!(1.00000001));
        assert_eq!(round8(dec!(-1.000000005)), dec!(-1.00000001));
        assert_eq!(round8(dec!(1.000000004)), dec!(1.00000000));
        assert_eq!(round8(dec!(2.123456785)), dec!(2.12345679));
    }

    #[test]
    fn test_round8_is_idempotent() {
        for x in [dec!(0), dec!(1.23456789123), dec!(-0.000000015), dec!(99999999.999999999)] {
            assert_eq!(round8(round8(x)), round8(x));
        }
    }

    #[test]
    fn test_round8_pads_scale() {
        assert_eq!(round8(dec!(1000)).to_string(), "1000.00000000");
        assert_eq!(round8(dec!(1000)).scale(), 8);
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(dec!(1000), dec!(10)), dec!(100));
        assert_eq!(percent_of(dec!(10000), dec!(0.5)), dec!(50));
        assert_eq!(percent_of(dec!(333.33333333), dec!(5)), dec!(16.66666667));
    }

    #[test]
    fn test_add_sub() {
        assert_eq!(add8(dec!(1000), dec!(500.12345678)), dec!(1500.12345678));
        assert_eq!(sub8(dec!(10000), dec!(1000)), dec!(9000));
    }
}
