//! The logical seed dataset.
//!
//! Every record refers to other records by natural key (hotel name, customer
//! email, promotion code, ...), never by surrogate id. Hotel-owned entities
//! are nested under their hotel, so their natural key is `(hotel, name)`.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  derive::check_range,
  status::{BookingStatus, DiscountKind, PaymentMethod, RoomStatus, StayStatus},
};

const DEMO_JSON: &str = include_str!("../data/demo.json");

// ─── Reference data ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSeed {
  pub name:        String,
  pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomTypeSeed {
  pub name:          String,
  pub max_occupancy: u32,
  /// Default nightly rate when no rate-calendar entry applies.
  pub base_rate:     Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressSeed {
  pub line1:       String,
  pub line2:       Option<String>,
  pub city:        String,
  pub region:      Option<String>,
  pub postal_code: String,
  pub country:     String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSeed {
  pub number:    String,
  pub room_type: String,
  #[serde(default = "active")]
  pub status:    RoomStatus,
}

fn active() -> RoomStatus { RoomStatus::Active }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NightlyRateSeed {
  pub date: NaiveDate,
  pub rate: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatePlanSeed {
  pub name:        String,
  pub description: Option<String>,
  #[serde(default)]
  pub rates:       Vec<NightlyRateSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxFeeSeed {
  pub name:    String,
  pub percent: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmployeeSeed {
  pub email:     String,
  pub full_name: String,
  pub role:      String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotelSeed {
  pub name:       String,
  pub brand:      Option<String>,
  pub timezone:   String,
  pub address:    AddressSeed,
  #[serde(default)]
  pub rooms:      Vec<RoomSeed>,
  #[serde(default)]
  pub rate_plans: Vec<RatePlanSeed>,
  #[serde(default)]
  pub tax_fees:   Vec<TaxFeeSeed>,
  #[serde(default)]
  pub employees:  Vec<EmployeeSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionSeed {
  pub code:       String,
  pub kind:       DiscountKind,
  pub value:      Decimal,
  pub valid_from: NaiveDate,
  pub valid_to:   NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerSeed {
  pub email:     String,
  pub full_name: String,
  pub phone:     Option<String>,
}

// ─── Transactional data ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaySeed {
  pub status:         StayStatus,
  pub checked_in_at:  Option<DateTime<Utc>>,
  pub checked_out_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSeed {
  pub method:  PaymentMethod,
  pub paid_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundSeed {
  /// Unique within the booking.
  pub reference:   String,
  pub amount:      Decimal,
  pub reason:      Option<String>,
  pub refunded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationSeed {
  pub cancelled_at: DateTime<Utc>,
  pub reason:       Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoShowSeed {
  pub recorded_at: DateTime<Utc>,
  #[serde(default)]
  pub fee:         Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingSeed {
  /// Natural key of the booking.
  pub reference:    String,
  /// Customer email.
  pub customer:     String,
  /// Hotel name.
  pub hotel:        String,
  /// Channel name.
  pub channel:      String,
  /// Rate plan name within the hotel.
  pub rate_plan:    Option<String>,
  pub status:       BookingStatus,
  pub checkin:      NaiveDate,
  pub checkout:     NaiveDate,
  /// Room numbers within the hotel.
  pub rooms:        Vec<String>,
  /// Promotion codes.
  #[serde(default)]
  pub promotions:   Vec<String>,
  pub stay:         Option<StaySeed>,
  pub payment:      Option<PaymentSeed>,
  #[serde(default)]
  pub refunds:      Vec<RefundSeed>,
  pub cancellation: Option<CancellationSeed>,
  pub no_show:      Option<NoShowSeed>,
}

impl BookingSeed {
  /// A booking is realized once it is confirmed and has a stay; only
  /// realized bookings are invoiced.
  pub fn is_realized(&self) -> bool {
    self.status == BookingStatus::Confirmed && self.stay.is_some()
  }
}

/// A maintenance block over `[from, to)` for one room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomBlockSeed {
  pub hotel:  String,
  pub room:   String,
  pub from:   NaiveDate,
  pub to:     NaiveDate,
  pub reason: Option<String>,
}

// ─── Dataset ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedDataset {
  #[serde(default)]
  pub channels:    Vec<ChannelSeed>,
  #[serde(default)]
  pub room_types:  Vec<RoomTypeSeed>,
  #[serde(default)]
  pub hotels:      Vec<HotelSeed>,
  #[serde(default)]
  pub promotions:  Vec<PromotionSeed>,
  #[serde(default)]
  pub customers:   Vec<CustomerSeed>,
  #[serde(default)]
  pub bookings:    Vec<BookingSeed>,
  #[serde(default)]
  pub room_blocks: Vec<RoomBlockSeed>,
}

impl SeedDataset {
  pub fn from_json(json: &str) -> Result<Self> { Ok(serde_json::from_str(json)?) }

  /// The bundled demonstration dataset.
  pub fn demo() -> Result<Self> { Self::from_json(DEMO_JSON) }

  /// Structural checks that need no database: unique natural keys, date
  /// ranges, and the status rules for stays and exception records.
  ///
  /// Cross-entity references are resolved by the loader, since they may
  /// point at rows loaded by an earlier run.
  pub fn validate(&self) -> Result<()> {
    unique("channel", self.channels.iter().map(|c| c.name.clone()))?;
    unique("room_type", self.room_types.iter().map(|r| r.name.clone()))?;
    unique("hotel", self.hotels.iter().map(|h| h.name.clone()))?;
    unique("promotion", self.promotions.iter().map(|p| p.code.clone()))?;
    unique("customer", self.customers.iter().map(|c| c.email.clone()))?;
    unique("booking", self.bookings.iter().map(|b| b.reference.clone()))?;
    unique(
      "refund",
      self.bookings.iter().flat_map(|b| b.refunds.iter().map(|r| r.reference.clone())),
    )?;
    unique(
      "employee",
      self.hotels.iter().flat_map(|h| h.employees.iter().map(|e| e.email.clone())),
    )?;

    for rt in &self.room_types {
      if rt.base_rate < Decimal::ZERO {
        return Err(Error::Constraint(format!(
          "room type {:?} has negative base rate",
          rt.name
        )));
      }
    }

    for hotel in &self.hotels {
      let scoped = |key: &str| format!("{}/{key}", hotel.name);
      unique("room", hotel.rooms.iter().map(|r| scoped(&r.number)))?;
      unique("rate_plan", hotel.rate_plans.iter().map(|p| scoped(&p.name)))?;
      unique("tax_fee", hotel.tax_fees.iter().map(|t| scoped(&t.name)))?;
      for plan in &hotel.rate_plans {
        unique(
          "rate_calendar",
          plan.rates.iter().map(|r| format!("{}/{}", scoped(&plan.name), r.date)),
        )?;
      }
      if let Some(tax) = hotel.tax_fees.iter().find(|t| t.percent < Decimal::ZERO) {
        return Err(Error::Constraint(format!(
          "tax {:?} has a negative rate",
          scoped(&tax.name)
        )));
      }
    }

    for promo in &self.promotions {
      if promo.valid_to < promo.valid_from {
        return Err(Error::InvalidDateRange {
          what:  format!("promotion {}", promo.code),
          start: promo.valid_from,
          end:   promo.valid_to,
        });
      }
    }

    for block in &self.room_blocks {
      check_range(
        format!("block on {}/{}", block.hotel, block.room),
        block.from,
        block.to,
      )?;
    }

    self.bookings.iter().try_for_each(validate_booking)
  }
}

fn validate_booking(b: &BookingSeed) -> Result<()> {
  let fail = |msg: &str| Err(Error::Constraint(format!("booking {}: {msg}", b.reference)));

  check_range(format!("booking {}", b.reference), b.checkin, b.checkout)?;
  if b.rooms.is_empty() {
    return fail("has no rooms");
  }
  unique("booking_room", b.rooms.iter().map(|r| format!("{}/{r}", b.reference)))?;
  unique(
    "booking_discount",
    b.promotions.iter().map(|p| format!("{}/{p}", b.reference)),
  )?;
  unique("refund", b.refunds.iter().map(|r| format!("{}/{}", b.reference, r.reference)))?;

  if b.stay.is_some() && b.status != BookingStatus::Confirmed {
    return fail("only confirmed bookings can have a stay");
  }
  if let Some(StaySeed {
    checked_in_at: Some(i),
    checked_out_at: Some(o),
    ..
  }) = &b.stay
    && o < i
  {
    return fail("stay checks out before it checks in");
  }
  if b.cancellation.is_some() && b.status != BookingStatus::Cancelled {
    return fail("cancellation recorded on a booking that is not cancelled");
  }
  if b.no_show.is_some() && b.status != BookingStatus::NoShow {
    return fail("no-show recorded on a booking that is not a no-show");
  }
  if b.payment.is_some() && !b.is_realized() {
    return fail("payment recorded on a booking that was never realized");
  }
  if !b.refunds.is_empty() && b.payment.is_none() {
    return fail("refund recorded without a payment");
  }
  Ok(())
}

fn unique(entity: &'static str, keys: impl Iterator<Item = String>) -> Result<()> {
  let mut seen = BTreeSet::new();
  for key in keys {
    if !seen.insert(key.clone()) {
      return Err(Error::DuplicateKey { entity, key });
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn demo_dataset_parses_and_validates() {
    let ds = SeedDataset::demo().unwrap();
    assert!(!ds.hotels.is_empty());
    assert!(!ds.bookings.is_empty());
    ds.validate().unwrap();
  }

  fn booking() -> BookingSeed {
    serde_json::from_str(
      r#"{
        "reference": "BK-1", "customer": "a@example.com", "hotel": "H",
        "channel": "Direct", "status": "CONFIRMED",
        "checkin": "2024-01-10", "checkout": "2024-01-13", "rooms": ["101"]
      }"#,
    )
    .unwrap()
  }

  fn dataset_with(booking: BookingSeed) -> SeedDataset {
    SeedDataset { bookings: vec![booking], ..Default::default() }
  }

  #[test]
  fn duplicate_natural_keys_are_rejected() {
    let b = booking();
    let ds = SeedDataset { bookings: vec![b.clone(), b], ..Default::default() };
    assert!(matches!(
      ds.validate(),
      Err(Error::DuplicateKey { entity: "booking", .. })
    ));
  }

  #[test]
  fn checkout_must_follow_checkin() {
    let mut b = booking();
    b.checkout = b.checkin;
    assert!(matches!(
      dataset_with(b).validate(),
      Err(Error::InvalidDateRange { .. })
    ));
  }

  #[test]
  fn exception_records_follow_status() {
    let mut b = booking();
    b.no_show = Some(NoShowSeed {
      recorded_at: "2024-01-11T09:00:00Z".parse().unwrap(),
      fee:         Decimal::ZERO,
    });
    assert!(matches!(dataset_with(b.clone()).validate(), Err(Error::Constraint(_))));

    b.status = BookingStatus::NoShow;
    dataset_with(b).validate().unwrap();
  }

  #[test]
  fn stay_requires_confirmed_booking() {
    let mut b = booking();
    b.status = BookingStatus::Cancelled;
    b.stay = Some(StaySeed {
      status:         StayStatus::CheckedIn,
      checked_in_at:  None,
      checked_out_at: None,
    });
    assert!(dataset_with(b).validate().is_err());
  }
}
