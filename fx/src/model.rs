//! Stored exchange rate records and their composite key.

use std::fmt;

use chrono::NaiveDate;
use ratekeeper_common::{CurrencyCode, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{FxError, FxResult};

/// Source tag prefix for rates synthesized from the opposite direction.
pub const INVERSE_SOURCE_PREFIX: &str = "inverse-of:";

/// Composite key of a stored rate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RateKey {
    pub from: CurrencyCode,
    pub to: CurrencyCode,
    pub date: NaiveDate,
}

impl RateKey {
    pub fn new(from: CurrencyCode, to: CurrencyCode, date: NaiveDate) -> Self {
        Self { from, to, date }
    }

    /// Same date, opposite direction.
    pub fn inverse(&self) -> Self {
        Self {
            from: self.to.clone(),
            to: self.from.clone(),
            date: self.date,
        }
    }

    /// Same pair, another date.
    pub fn on(&self, date: NaiveDate) -> Self {
        Self {
            from: self.from.clone(),
            to: self.to.clone(),
            date,
        }
    }
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.from, self.to, self.date)
    }
}

/// Precedence of a rate's origin. When two records share a key, the higher one is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourcePriority(pub u8);

impl SourcePriority {
    /// Read-time synthesized records (inverses). Never persisted.
    pub const DERIVED: Self = Self(0);
    /// Bulk imports from files or other systems.
    pub const IMPORTED: Self = Self(10);
    /// Highest-ranked configured provider.
    pub const PROVIDER: Self = Self(50);
    /// Entered by a user.
    pub const MANUAL: Self = Self(100);

    /// Priority of the provider at `position` in the configured order.
    pub fn for_provider_position(position: usize) -> Self {
        let step = u8::try_from(position).unwrap_or(u8::MAX);
        Self(Self::PROVIDER.0.saturating_sub(step).max(Self::IMPORTED.0 + 1))
    }
}

impl fmt::Display for SourcePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An exchange rate for one direction on one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub from: CurrencyCode,
    pub to: CurrencyCode,
    pub date: NaiveDate,
    /// Units of `to` per one unit of `from`. Must be positive.
    pub rate: Decimal,
    /// Provider name or derivation tag.
    pub source: String,
    pub priority: SourcePriority,
    pub fetched_at: Timestamp,
}

impl ExchangeRate {
    pub fn new(
        from: CurrencyCode,
        to: CurrencyCode,
        date: NaiveDate,
        rate: Decimal,
        source: impl Into<String>,
        priority: SourcePriority,
    ) -> Self {
        Self {
            from,
            to,
            date,
            rate,
            source: source.into(),
            priority,
            fetched_at: ratekeeper_common::now(),
        }
    }

    pub fn key(&self) -> RateKey {
        RateKey::new(self.from.clone(), self.to.clone(), self.date)
    }

    /// Reject records whose rate is not strictly positive.
    pub fn validate(&self) -> FxResult<()> {
        if self.rate <= Decimal::ZERO {
            return Err(FxError::StorageIntegrity {
                key: self.key(),
                rate: self.rate,
            });
        }
        Ok(())
    }

    /// The same quote expressed in the opposite direction.
    pub fn inverted(&self) -> FxResult<ExchangeRate> {
        self.validate()?;
        Ok(ExchangeRate {
            from: self.to.clone(),
            to: self.from.clone(),
            date: self.date,
            rate: Decimal::ONE / self.rate,
            source: format!("{}{}", INVERSE_SOURCE_PREFIX, self.source),
            priority: SourcePriority::DERIVED,
            fetched_at: self.fetched_at,
        })
    }

    pub fn is_derived(&self) -> bool {
        self.source.starts_with(INVERSE_SOURCE_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    #[test]
    fn test_inverted_rate() {
        let rate = ExchangeRate::new(
            CurrencyCode::eur(),
            CurrencyCode::usd(),
            date(),
            dec!(1.25),
            "frankfurter",
            SourcePriority::PROVIDER,
        );
        let inverse = rate.inverted().unwrap();

        assert_eq!(inverse.from, CurrencyCode::usd());
        assert_eq!(inverse.to, CurrencyCode::eur());
        assert_eq!(inverse.rate, dec!(0.8));
        assert_eq!(inverse.source, "inverse-of:frankfurter");
        assert_eq!(inverse.priority, SourcePriority::DERIVED);
        assert!(inverse.is_derived());
    }

    #[test]
    fn test_zero_rate_cannot_be_inverted() {
        let rate = ExchangeRate::new(
            CurrencyCode::eur(),
            CurrencyCode::usd(),
            date(),
            Decimal::ZERO,
            "broken",
            SourcePriority::IMPORTED,
        );
        assert!(matches!(rate.inverted(), Err(FxError::StorageIntegrity { .. })));
    }

    #[test]
    fn test_provider_priorities_descend() {
        let first = SourcePriority::for_provider_position(0);
        let second = SourcePriority::for_provider_position(1);
        assert_eq!(first, SourcePriority::PROVIDER);
        assert!(first > second);
        assert!(second > SourcePriority::IMPORTED);
        assert!(SourcePriority::for_provider_position(500) > SourcePriority::IMPORTED);
        assert!(SourcePriority::MANUAL > first);
    }

    proptest! {
        #[test]
        fn inverse_round_trip_stays_close(units in 1i64..10_000_000) {
            let rate = ExchangeRate::new(
                CurrencyCode::ils(),
                CurrencyCode::eur(),
                date(),
                Decimal::new(units, 4),
                "test",
                SourcePriority::PROVIDER,
            );
            let back = rate.inverted().unwrap().inverted().unwrap();
            prop_assert!((back.rate - rate.rate).abs() < dec!(0.000001));
        }
    }
}
