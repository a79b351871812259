//! Currencies, exchange rates and withdrawal fee schedule

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::precision::{percent_of, round8};

/// 1 KAUS = 120 KRW
pub const KAUS_PRICE_KRW: Decimal = Decimal::from_parts(120, 0, 0, false, 0);

/// 1 KAUS = 0.09 USD
pub const KAUS_PRICE_USD: Decimal = Decimal::from_parts(9, 0, 0, false, 2);

/// KRW per USD, used to convert minimum fees across currencies
pub const USD_KRW_RATE: Decimal = Decimal::from_parts(1320, 0, 0, false, 0);

/// Fiat currencies accepted for purchases and withdrawals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Krw,
    Usd,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Krw => "KRW",
            Currency::Usd => "USD",
        }
    }

    /// Price of one KAUS in this currency
    pub fn kaus_price(&self) -> Decimal {
        match self {
            Currency::Krw => KAUS_PRICE_KRW,
            Currency::Usd => KAUS_PRICE_USD,
        }
    }

    /// Smallest withdrawal accepted in this currency
    pub fn min_withdrawal(&self) -> Decimal {
        match self {
            Currency::Krw => Decimal::from(10_000),
            Currency::Usd => Decimal::from(10),
        }
    }

    /// Largest withdrawal accepted in this currency
    pub fn max_withdrawal(&self) -> Decimal {
        match self {
            Currency::Krw => Decimal::from(100_000_000),
            Currency::Usd => Decimal::from(100_000),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "KRW" => Ok(Currency::Krw),
            "USD" => Ok(Currency::Usd),
            other => Err(format!("unsupported currency: {}", other)),
        }
    }
}

/// KAUS bought with `amount` of `currency`
pub fn kaus_from_fiat(amount: Decimal, currency: Currency) -> Decimal {
    round8(amount / currency.kaus_price())
}

/// Fiat value of `kaus` in `currency`
pub fn fiat_from_kaus(kaus: Decimal, currency: Currency) -> Decimal {
    round8(kaus * currency.kaus_price())
}

/// Convert a fiat amount between currencies at `USD_KRW_RATE`
pub fn convert_fiat(amount: Decimal, from: Currency, to: Currency) -> Decimal {
    match (from, to) {
        (Currency::Usd, Currency::Krw) => round8(amount * USD_KRW_RATE),
        (Currency::Krw, Currency::Usd) => round8(amount / USD_KRW_RATE),
        _ => round8(amount),
    }
}

/// Payout rails for withdrawals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalMethod {
    Bank,
    Paypal,
    Crypto,
}

/// Fee schedule of a withdrawal method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSchedule {
    /// Percentage of the requested amount
    pub percentage: Decimal,
    /// Minimum fee, expressed in `fee_currency`
    pub min_fee: Decimal,
    pub fee_currency: Currency,
}

impl WithdrawalMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalMethod::Bank => "bank",
            WithdrawalMethod::Paypal => "paypal",
            WithdrawalMethod::Crypto => "crypto",
        }
    }

    pub fn fee_schedule(&self) -> FeeSchedule {
        match self {
            WithdrawalMethod::Bank => FeeSchedule {
                percentage: Decimal::new(50, 2),
                min_fee: Decimal::from(1000),
                fee_currency: Currency::Krw,
            },
            WithdrawalMethod::Paypal => FeeSchedule {
                percentage: Decimal::new(290, 2),
                min_fee: Decimal::new(50, 2),
                fee_currency: Currency::Usd,
            },
            WithdrawalMethod::Crypto => FeeSchedule {
                percentage: Decimal::new(10, 2),
                min_fee: Decimal::ZERO,
                fee_currency: Currency::Usd,
            },
        }
    }

    /// Minimum fee of this method expressed in `currency`
    pub fn min_fee(&self, currency: Currency) -> Decimal {
        let schedule = self.fee_schedule();
        convert_fiat(schedule.min_fee, schedule.fee_currency, currency)
    }

    /// `max(round8(amount * pct / 100), min_fee(currency))`
    pub fn fee_for(&self, amount: Decimal, currency: Currency) -> Decimal {
        let percentage_fee = percent_of(amount, self.fee_schedule().percentage);
        percentage_fee.max(self.min_fee(currency))
    }

    /// Days until funds arrive at the destination
    pub fn arrival_days(&self) -> i64 {
        match self {
            WithdrawalMethod::Bank => 1,
            WithdrawalMethod::Paypal | WithdrawalMethod::Crypto => 0,
        }
    }
}

impl fmt::Display for WithdrawalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WithdrawalMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bank" => Ok(WithdrawalMethod::Bank),
            "paypal" => Ok(WithdrawalMethod::Paypal),
            "crypto" => Ok(WithdrawalMethod::Crypto),
            other => Err(format!("unsupported withdrawal method: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_constants() {
        assert_eq!(KAUS_PRICE_KRW, dec!(120));
        assert_eq!(KAUS_PRICE_USD, dec!(0.09));
        assert_eq!(USD_KRW_RATE, dec!(1320));
    }

    #[test]
    fn test_bank_fee_uses_minimum() {
        let fee = WithdrawalMethod::Bank.fee_for(dec!(10000), Currency::Krw);
        assert_eq!(fee, dec!(1000));
        assert_eq!(round8(dec!(10000) - fee).to_string(), "9000.00000000");
    }

    #[test]
    fn test_bank_fee_uses_percentage_when_larger() {
        let fee = WithdrawalMethod::Bank.fee_for(dec!(1000000), Currency::Krw);
        assert_eq!(fee, dec!(5000));
    }

    #[test]
    fn test_min_fee_converted_across_currencies() {
        // 1000 KRW minimum expressed in USD
        assert_eq!(WithdrawalMethod::Bank.min_fee(Currency::Usd), dec!(0.75757576));
        // 0.50 USD minimum expressed in KRW
        assert_eq!(WithdrawalMethod::Paypal.min_fee(Currency::Krw), dec!(660));
        assert_eq!(WithdrawalMethod::Crypto.min_fee(Currency::Krw), dec!(0));
    }

    #[test]
    fn test_fee_never_below_minimum() {
        for method in [WithdrawalMethod::Bank, WithdrawalMethod::Paypal, WithdrawalMethod::Crypto] {
            for currency in [Currency::Krw, Currency::Usd] {
                for amount in [currency.min_withdrawal(), dec!(12345.678), currency.max_withdrawal()] {
                    assert!(method.fee_for(amount, currency) >= method.min_fee(currency));
                }
            }
        }
    }

    #[test]
    fn test_kaus_conversion() {
        assert_eq!(kaus_from_fiat(dec!(120000), Currency::Krw), dec!(1000));
        assert_eq!(kaus_from_fiat(dec!(10), Currency::Usd), dec!(111.11111111));
        assert_eq!(fiat_from_kaus(dec!(1000), Currency::Usd), dec!(90));
    }

    #[test]
    fn test_currency_parse() {
        assert_eq!("krw".parse::<Currency>().unwrap(), Currency::Krw);
        assert!("EUR".parse::<Currency>().is_err());
        assert_eq!(serde_json::to_string(&Currency::Usd).unwrap(), "\"USD\"");
    }
}
