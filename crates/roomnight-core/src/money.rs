//! Fixed-point currency helpers.
//!
//! Amounts are [`Decimal`] with two fractional digits. Rounding is always
//! half-away-from-zero, applied once per computed amount.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::{Error, Result};

/// Round to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
  let mut rounded =
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
  rounded.rescale(2);
  rounded
}

/// `round(base * percent / 100, 2)`.
pub fn percent_of(base: Decimal, percent: Decimal) -> Decimal {
  round_money(base * percent / Decimal::ONE_HUNDRED)
}

/// Convert to integer minor units for storage.
pub fn to_cents(amount: Decimal) -> Result<i64> {
  let rounded = round_money(amount);
  i64::try_from(rounded.mantissa()).map_err(|_| Error::MoneyOverflow(amount))
}

pub fn from_cents(cents: i64) -> Decimal { Decimal::new(cents, 2) }

#[cfg(test)]
mod tests {
  use std::str::FromStr;

  use super::*;

  fn d(s: &str) -> Decimal { Decimal::from_str(s).unwrap() }

  #[test]
  fn rounds_half_away_from_zero() {
    assert_eq!(round_money(d("10.005")), d("10.01"));
    assert_eq!(round_money(d("-10.005")), d("-10.01"));
    assert_eq!(round_money(d("10.004")), d("10.00"));
  }

  #[test]
  fn percent_rounds_once() {
    // 333.33 * 12.5% = 41.66625
    assert_eq!(percent_of(d("333.33"), d("12.5")), d("41.67"));
  }

  #[test]
  fn cents_conversion() {
    assert_eq!(to_cents(d("150")).unwrap(), 15000);
    assert_eq!(to_cents(d("-12.34")).unwrap(), -1234);
    assert_eq!(from_cents(30000), d("300.00"));
    assert_eq!(from_cents(30000).to_string(), "300.00");
  }
}
