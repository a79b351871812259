//! KAUS purchase packages

use rust_decimal::Decimal;
use serde::Serialize;

use super::currency::Currency;
use super::precision::{add8, percent_of};

/// A purchasable bundle of KAUS
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Package {
    pub id: &'static str,
    pub label: &'static str,
    pub kaus_amount: Decimal,
    pub price_krw: Decimal,
    pub price_usd: Decimal,
    /// Bonus in percent of `kaus_amount`
    pub bonus_pct: Decimal,
    pub popular: bool,
}

pub const PURCHASE_PACKAGES: [Package; 4] = [
    Package {
        id: "starter",
        label: "Starter",
        kaus_amount: Decimal::from_parts(1_000, 0, 0, false, 0),
        price_krw: Decimal::from_parts(100_000, 0, 0, false, 0),
        price_usd: Decimal::from_parts(75, 0, 0, false, 0),
        bonus_pct: Decimal::ZERO,
        popular: false,
    },
    Package {
        id: "growth",
        label: "Growth",
        kaus_amount: Decimal::from_parts(5_000, 0, 0, false, 0),
        price_krw: Decimal::from_parts(475_000, 0, 0, false, 0),
        price_usd: Decimal::from_parts(350, 0, 0, false, 0),
        bonus_pct: Decimal::from_parts(5, 0, 0, false, 0),
        popular: true,
    },
    Package {
        id: "premium",
        label: "Premium",
        kaus_amount: Decimal::from_parts(10_000, 0, 0, false, 0),
        price_krw: Decimal::from_parts(900_000, 0, 0, false, 0),
        price_usd: Decimal::from_parts(670, 0, 0, false, 0),
        bonus_pct: Decimal::from_parts(10, 0, 0, false, 0),
        popular: false,
    },
    Package {
        id: "sovereign",
        label: "Sovereign",
        kaus_amount: Decimal::from_parts(50_000, 0, 0, false, 0),
        price_krw: Decimal::from_parts(4_000_000, 0, 0, false, 0),
        price_usd: Decimal::from_parts(3_000, 0, 0, false, 0),
        bonus_pct: Decimal::from_parts(20, 0, 0, false, 0),
        popular: false,
    },
];

impl Package {
    pub fn find(id: &str) -> Option<&'static Package> {
        PURCHASE_PACKAGES.iter().find(|p| p.id == id)
    }

    pub fn price(&self, currency: Currency) -> Decimal {
        match currency {
            Currency::Krw => self.price_krw,
            Currency::Usd => self.price_usd,
        }
    }

    pub fn bonus_amount(&self) -> Decimal {
        percent_of(self.kaus_amount, self.bonus_pct)
    }

    /// KAUS credited on settlement: base plus bonus
    pub fn total_kaus(&self) -> Decimal {
        add8(self.kaus_amount, self.bonus_amount())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_find_package() {
        assert!(Package::find("growth").is_some());
        assert!(Package::find("platinum").is_none());
    }

    #[test]
    fn test_package_totals() {
        let growth = Package::find("growth").unwrap();
        assert_eq!(growth.bonus_amount(), dec!(250));
        assert_eq!(growth.total_kaus(), dec!(5250));

        let sovereign = Package::find("sovereign").unwrap();
        assert_eq!(sovereign.total_kaus(), dec!(60000));
        assert_eq!(sovereign.price(Currency::Usd), dec!(3000));

        let starter = Package::find("starter").unwrap();
        assert_eq!(starter.total_kaus().to_string(), "1000.00000000");
    }
}
