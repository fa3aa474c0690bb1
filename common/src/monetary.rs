//! Amount conversion and the subunit rounding policy.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::CurrencyCode;

/// Rounding rule applied to every converted amount.
///
/// Midpoints round away from zero, which for the non-negative amounts the
/// engine accepts is plain half-up.
pub const ROUNDING_STRATEGY: RoundingStrategy = RoundingStrategy::MidpointAwayFromZero;

/// Round `value` to the smallest subunit of `currency`.
///
/// This is the only place converted amounts are rounded.
pub fn round_to_subunit(value: Decimal, currency: &CurrencyCode) -> Decimal {
    value.round_dp_with_strategy(currency.decimal_places(), ROUNDING_STRATEGY)
}

/// Convert `amount` at `rate` into `target`, rounded to its subunit.
///
/// Returns `None` when the product does not fit in a `Decimal`.
pub fn convert_amount(amount: Decimal, rate: Decimal, target: &CurrencyCode) -> Option<Decimal> {
    amount
        .checked_mul(rate)
        .map(|value| round_to_subunit(value, target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_half_up() {
        let usd = CurrencyCode::usd();
        assert_eq!(round_to_subunit(dec!(1.005), &usd), dec!(1.01));
        assert_eq!(round_to_subunit(dec!(1.0049), &usd), dec!(1.00));
        assert_eq!(round_to_subunit(dec!(2.5), &CurrencyCode::jpy()), dec!(3));
        assert_eq!(round_to_subunit(dec!(3.4999), &CurrencyCode::jpy()), dec!(3));
    }

    #[test]
    fn test_convert_rounds_to_target() {
        let eur = convert_amount(dec!(60000), dec!(0.253), &CurrencyCode::eur()).unwrap();
        assert_eq!(eur, dec!(15180));

        let jpy = convert_amount(dec!(10), dec!(149.555), &CurrencyCode::jpy()).unwrap();
        assert_eq!(jpy, dec!(1496));
    }

    #[test]
    fn test_convert_overflow_is_none() {
        let huge = Decimal::MAX / dec!(10);
        assert_eq!(convert_amount(huge, dec!(150), &CurrencyCode::jpy()), None);
        assert!(convert_amount(huge, dec!(1), &CurrencyCode::jpy()).is_some());
    }

    proptest! {
        #[test]
        fn rounding_is_idempotent(cents in 0i64..10_000_000_000, scale in 0u32..6) {
            let value = Decimal::new(cents, scale);
            let eur = CurrencyCode::eur();
            let once = round_to_subunit(value, &eur);
            prop_assert_eq!(round_to_subunit(once, &eur), once);
            prop_assert!((once - value).abs() <= dec!(0.005));
        }
    }
}
