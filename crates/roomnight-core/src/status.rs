//! Enumerated status domains.
//!
//! Every domain is stored as its upper-case string form; the `CHECK`
//! constraints in the backend schema list exactly these values.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::{Error, Result};

macro_rules! status_domain {
  ($(#[$meta:meta])* $name:ident { $($variant:ident),+ $(,)? }) => {
    $(#[$meta])*
    #[derive(
      Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
      Serialize, Deserialize, Display, EnumString, AsRefStr,
    )]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    #[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
    pub enum $name {
      $($variant),+
    }
  };
}

status_domain! {
  /// Operational status of a physical room.
  RoomStatus { Active, Inactive, OutOfService }
}

status_domain! {
  /// Booking intent status.
  BookingStatus { Confirmed, Cancelled, NoShow }
}

status_domain! {
  StayStatus { CheckedIn, CheckedOut }
}

status_domain! {
  /// Availability state of one room on one calendar night.
  Availability { Available, Occupied, Blocked }
}

status_domain! {
  DiscountKind { Percent, Fixed }
}

status_domain! {
  InvoiceStatus { Open, Paid, Void, Refunded }
}

status_domain! {
  LineItemKind { Room, Service, Tax, Discount, Other }
}

status_domain! {
  PaymentMethod { Card, Cash, BankTransfer }
}

/// Parse a stored status string, naming the domain on failure.
pub fn parse_status<T: FromStr>(domain: &'static str, value: &str) -> Result<T> {
  T::from_str(value).map_err(|_| Error::UnknownStatus {
    domain,
    value: value.to_owned(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn string_forms_are_screaming_snake_case() {
    assert_eq!(RoomStatus::OutOfService.as_ref(), "OUT_OF_SERVICE");
    assert_eq!(BookingStatus::NoShow.to_string(), "NO_SHOW");
    assert_eq!(
      parse_status::<PaymentMethod>("payment_method", "BANK_TRANSFER").unwrap(),
      PaymentMethod::BankTransfer
    );
  }

  #[test]
  fn serde_matches_strum() {
    let json = serde_json::to_string(&StayStatus::CheckedOut).unwrap();
    assert_eq!(json, "\"CHECKED_OUT\"");
  }

  #[test]
  fn unknown_value_names_domain() {
    let err = parse_status::<Availability>("availability", "FREE").unwrap_err();
    assert!(matches!(err, Error::UnknownStatus { domain: "availability", .. }));
  }
}
