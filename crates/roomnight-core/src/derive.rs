//! Room-night expansion.
//!
//! A booking is intent over a half-open date interval `[checkin, checkout)`.
//! Occupancy is recorded one row per (room, night); the checkout date itself
//! is never a night. All occupancy metrics are computed from these rows.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  status::{Availability, BookingStatus},
};

/// The fields of a booking that the expansion reads.
#[derive(Debug, Clone, Copy)]
pub struct BookingSpan {
  pub booking_id: i64,
  pub status:     BookingStatus,
  pub checkin:    NaiveDate,
  pub checkout:   NaiveDate,
}

/// One room on one calendar night.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomNight {
  pub room_id:      i64,
  pub night_date:   NaiveDate,
  pub availability: Availability,
  /// The occupying booking, for `Occupied` nights.
  pub booking_id:   Option<i64>,
}

/// Every night in `[start, end)`.
pub fn nights(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
  start.iter_days().take_while(move |d| *d < end)
}

/// `end - start` in whole nights; zero when the range is empty or inverted.
pub fn night_count(start: NaiveDate, end: NaiveDate) -> i64 {
  (end - start).num_days().max(0)
}

/// Reject a range whose end is not strictly after its start.
pub fn check_range(what: impl Into<String>, start: NaiveDate, end: NaiveDate) -> Result<()> {
  if end <= start {
    return Err(Error::InvalidDateRange { what: what.into(), start, end });
  }
  Ok(())
}

/// Expand a booking into occupied room-nights for each assigned room.
///
/// Only `Confirmed` bookings occupy rooms; any other status yields nothing.
pub fn expand_booking(booking: &BookingSpan, room_ids: &[i64]) -> Result<Vec<RoomNight>> {
  if booking.status != BookingStatus::Confirmed {
    return Ok(Vec::new());
  }
  check_range(
    format!("booking {}", booking.booking_id),
    booking.checkin,
    booking.checkout,
  )?;

  let mut out = Vec::with_capacity(
    room_ids.len() * night_count(booking.checkin, booking.checkout) as usize,
  );
  for &room_id in room_ids {
    out.extend(nights(booking.checkin, booking.checkout).map(|night_date| RoomNight {
      room_id,
      night_date,
      availability: Availability::Occupied,
      booking_id: Some(booking.booking_id),
    }));
  }
  Ok(out)
}

/// Expand a maintenance block into blocked room-nights.
pub fn expand_block(room_id: i64, from: NaiveDate, to: NaiveDate) -> Result<Vec<RoomNight>> {
  check_range(format!("block on room {room_id}"), from, to)?;
  Ok(
    nights(from, to)
      .map(|night_date| RoomNight {
        room_id,
        night_date,
        availability: Availability::Blocked,
        booking_id: None,
      })
      .collect(),
  )
}

/// Fail if two rows claim the same (room, night).
pub fn check_exclusive(rows: &[RoomNight]) -> Result<()> {
  let mut seen: BTreeMap<(i64, NaiveDate), &RoomNight> = BTreeMap::new();
  for row in rows {
    if let Some(prev) = seen.insert((row.room_id, row.night_date), row) {
      return Err(Error::Constraint(format!(
        "room {} on {} is claimed twice ({} by {:?}, {} by {:?})",
        row.room_id,
        row.night_date,
        prev.availability,
        prev.booking_id,
        row.availability,
        row.booking_id,
      )));
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
  }

  fn span(status: BookingStatus) -> BookingSpan {
    BookingSpan {
      booking_id: 7,
      status,
      checkin: date(2024, 1, 10),
      checkout: date(2024, 1, 13),
    }
  }

  #[test]
  fn checkout_night_is_excluded() {
    let rows = expand_booking(&span(BookingStatus::Confirmed), &[1]).unwrap();
    let dates: Vec<_> = rows.iter().map(|r| r.night_date).collect();
    assert_eq!(dates, vec![date(2024, 1, 10), date(2024, 1, 11), date(2024, 1, 12)]);
    assert!(rows.iter().all(|r| r.availability == Availability::Occupied));
  }

  #[test]
  fn one_row_per_room_per_night() {
    let rows = expand_booking(&span(BookingStatus::Confirmed), &[1, 2]).unwrap();
    assert_eq!(rows.len(), 6);
    assert_eq!(rows.iter().filter(|r| r.room_id == 2).count(), 3);
  }

  #[test]
  fn only_confirmed_bookings_occupy() {
    assert!(expand_booking(&span(BookingStatus::Cancelled), &[1]).unwrap().is_empty());
    assert!(expand_booking(&span(BookingStatus::NoShow), &[1]).unwrap().is_empty());
  }

  #[test]
  fn inverted_range_is_rejected() {
    let mut b = span(BookingStatus::Confirmed);
    b.checkout = b.checkin;
    assert!(matches!(
      expand_booking(&b, &[1]),
      Err(Error::InvalidDateRange { .. })
    ));
  }

  #[test]
  fn month_boundary() {
    let n: Vec<_> = nights(date(2024, 2, 28), date(2024, 3, 2)).collect();
    assert_eq!(n, vec![date(2024, 2, 28), date(2024, 2, 29), date(2024, 3, 1)]);
    assert_eq!(night_count(date(2024, 2, 28), date(2024, 3, 2)), 3);
  }

  #[test]
  fn overlapping_claims_conflict() {
    let mut rows = expand_booking(&span(BookingStatus::Confirmed), &[1]).unwrap();
    rows.extend(expand_block(1, date(2024, 1, 12), date(2024, 1, 14)).unwrap());
    assert!(matches!(check_exclusive(&rows), Err(Error::Constraint(_))));

    let rows = expand_block(1, date(2024, 1, 13), date(2024, 1, 14)).unwrap();
    assert!(check_exclusive(&rows).is_ok());
  }
}
