//! The hotel model catalog: raw extracts of the OLTP tables, staging
//! passthroughs over them, then dimensions, facts and reports in the mart
//! layer.
//!
//! Money columns stay in integer cents all the way through; occupancy is a
//! ratio rounded to four places.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use roomnight_core::{
  Error, Result,
  derive::check_range,
  pipeline::{Extract, Grain, Pipeline, Step},
};

use crate::encode::encode_date;

/// Inclusive bounds of the generated calendar spine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarRange {
  pub start: NaiveDate,
  pub end:   NaiveDate,
}

impl CalendarRange {
  pub fn days(&self) -> i64 { (self.end - self.start).num_days() + 1 }
}

/// Build the validated pipeline for a calendar range. Raw extracts are read
/// in chunks of at most `chunk_rows` rows.
pub fn catalog(calendar: CalendarRange, chunk_rows: u64) -> Result<Pipeline> {
  check_range("calendar spine", calendar.start, calendar.end)?;
  let mut steps = raw(calendar, chunk_rows)?;
  steps.extend(staging());
  steps.extend(dimensions(calendar));
  steps.extend(facts());
  steps.extend(reports());
  Pipeline::new(steps)
}

/// Fails when `column` is not unique in the relation under test.
fn unique(column: &str) -> String {
  format!("SELECT {column} FROM {{this}} GROUP BY {column} HAVING COUNT(*) > 1")
}

fn not_null(column: &str) -> String { format!("SELECT 1 FROM {{this}} WHERE {column} IS NULL") }

// ─── Raw ─────────────────────────────────────────────────────────────────────

/// Every OLTP table with the key that orders its chunks.
const RAW_TABLES: &[(&str, &str)] = &[
  ("address", "address_id"),
  ("channel", "channel_id"),
  ("room_type", "room_type_id"),
  ("customer", "customer_id"),
  ("promotion", "promotion_id"),
  ("hotel", "hotel_id"),
  ("room", "room_id"),
  ("rate_plan", "rate_plan_id"),
  ("rate_calendar", "rate_plan_id, rate_date"),
  ("tax_fee", "tax_fee_id"),
  ("employee", "employee_id"),
  ("booking", "booking_id"),
  ("booking_room", "booking_id, room_id"),
  ("booking_discount", "booking_id, promotion_id"),
  ("stay", "stay_id"),
  ("booking_cancellation", "booking_id"),
  ("no_show", "booking_id"),
  ("room_block", "room_id, from_date"),
  ("room_night", "room_id, night_date"),
  ("invoice", "invoice_id"),
  ("invoice_line_item", "invoice_id, line_no"),
  ("payment", "payment_id"),
  ("refund", "refund_id"),
];

/// Nightly tables, extracted in monthly windows over the calendar. Nights
/// outside the calendar are not extracted.
const PARTITIONED: &[(&str, &str)] =
  &[("rate_calendar", "rate_date"), ("room_night", "night_date")];

fn raw(calendar: CalendarRange, chunk_rows: u64) -> Result<Vec<Step>> {
  let horizon = calendar.end.succ_opt().ok_or_else(|| Error::InvalidDateRange {
    what:  "calendar spine".into(),
    start: calendar.start,
    end:   calendar.end,
  })?;

  Ok(
    RAW_TABLES
      .iter()
      .map(|&(table, key)| {
        let mut extract = Extract::table(table, key).chunked(chunk_rows);
        if let Some(&(_, column)) = PARTITIONED.iter().find(|(t, _)| *t == table) {
          extract = extract.partition(column, Grain::Month, calendar.start, horizon);
        }
        Step::raw(format!("raw_{table}"), extract)
      })
      .collect(),
  )
}

// ─── Staging ─────────────────────────────────────────────────────────────────

/// Passthrough of `raw_{table}`, renaming where the column name is ambiguous
/// downstream.
fn stage(table: &str, columns: &str) -> Step {
  Step::staging(format!("stg_{table}"), format!("SELECT {columns} FROM raw_{table}"))
    .after([format!("raw_{table}")])
}

fn staging() -> Vec<Step> {
  vec![
    stage(
      "address",
      "address_id, line1 AS address_line1, line2 AS address_line2, city, region, postal_code,
       country",
    ),
    stage("channel", "channel_id, name AS channel_name, description AS channel_description"),
    stage("room_type", "room_type_id, name AS room_type_name, max_occupancy, base_rate_cents"),
    stage("customer", "customer_id, email AS customer_email, full_name AS customer_name, phone"),
    stage(
      "promotion",
      "promotion_id, code AS promotion_code, kind AS discount_kind, value AS discount_value,
       valid_from, valid_to",
    )
    .assert("unique_promotion_code", unique("promotion_code")),
    stage("hotel", "hotel_id, name AS hotel_name, brand, address_id, timezone")
      .assert("unique_hotel_id", unique("hotel_id")),
    stage("room", "room_id, hotel_id, room_type_id, room_number, status AS room_status")
      .assert("unique_room_id", unique("room_id")),
    stage(
      "rate_plan",
      "rate_plan_id, hotel_id, name AS rate_plan_name, description AS rate_plan_description",
    ),
    stage("rate_calendar", "rate_plan_id, rate_date, rate_cents"),
    stage("tax_fee", "tax_fee_id, hotel_id, name AS tax_name, percent AS tax_percent"),
    stage(
      "employee",
      "employee_id, hotel_id, email AS employee_email, full_name AS employee_name,
       role AS employee_role",
    ),
    stage(
      "booking",
      "booking_id, reference AS booking_reference, customer_id, hotel_id, channel_id,
       rate_plan_id, status AS booking_status, checkin_date, checkout_date",
    )
    .assert("unique_booking_id", unique("booking_id")),
    stage("booking_room", "booking_id, room_id"),
    stage("booking_discount", "booking_id, promotion_id"),
    stage("stay", "stay_id, booking_id, status AS stay_status, checked_in_at, checked_out_at"),
    stage("booking_cancellation", "booking_id, cancelled_at, reason AS cancellation_reason"),
    stage("no_show", "booking_id, recorded_at, fee_cents AS no_show_fee_cents"),
    stage("room_block", "room_id, from_date, to_date, reason AS block_reason"),
    stage("room_night", "room_id, night_date, availability, booking_id"),
    stage("invoice", "invoice_id, booking_id, status AS invoice_status"),
    stage(
      "invoice_line_item",
      "invoice_id, line_no, kind AS line_kind, description, quantity, amount_cents",
    ),
    stage("payment", "payment_id, invoice_id, method AS payment_method, amount_cents, paid_at"),
    stage(
      "refund",
      "refund_id, payment_id, reference AS refund_reference, amount_cents, reason, refunded_at",
    ),
  ]
}

// ─── Dimensions ──────────────────────────────────────────────────────────────

fn dimensions(calendar: CalendarRange) -> Vec<Step> {
  let spine = format!(
    "WITH RECURSIVE spine(calendar_date) AS (
       SELECT date('{start}')
       UNION ALL
       SELECT date(calendar_date, '+1 day') FROM spine WHERE calendar_date < date('{end}')
     )
     SELECT calendar_date,
            CAST(strftime('%Y', calendar_date) AS INTEGER) AS year,
            CAST(strftime('%m', calendar_date) AS INTEGER) AS month,
            CAST(strftime('%d', calendar_date) AS INTEGER) AS day_of_month,
            CAST(strftime('%w', calendar_date) AS INTEGER) AS day_of_week,
            strftime('%Y-%m', calendar_date) AS year_month,
            CAST(strftime('%w', calendar_date) AS INTEGER) IN (0, 6) AS is_weekend
     FROM spine",
    start = encode_date(calendar.start),
    end = encode_date(calendar.end),
  );

  vec![
    Step::mart(
      "dim_hotel",
      "SELECT h.hotel_id, h.hotel_name, h.brand, h.timezone,
              a.address_line1, a.address_line2, a.city, a.region, a.postal_code, a.country
       FROM stg_hotel h
       JOIN stg_address a ON a.address_id = h.address_id",
    )
    .after(["stg_hotel", "stg_address"])
    .assert("unique_hotel_id", unique("hotel_id")),
    Step::mart(
      "dim_room",
      "SELECT r.room_id, r.hotel_id, r.room_number, r.room_status,
              t.room_type_name, t.max_occupancy, t.base_rate_cents
       FROM stg_room r
       JOIN stg_room_type t ON t.room_type_id = r.room_type_id",
    )
    .after(["stg_room", "stg_room_type"])
    .assert("unique_room_id", unique("room_id")),
    Step::mart(
      "dim_customer",
      "SELECT c.customer_id, c.customer_email, c.customer_name, c.phone,
              COUNT(b.booking_id) AS booking_count,
              MIN(b.checkin_date) AS first_checkin_date
       FROM stg_customer c
       LEFT JOIN stg_booking b ON b.customer_id = c.customer_id
       GROUP BY c.customer_id, c.customer_email, c.customer_name, c.phone",
    )
    .after(["stg_customer", "stg_booking"])
    .assert("unique_customer_id", unique("customer_id")),
    Step::mart("dim_calendar", spine)
      .assert("unique_calendar_date", unique("calendar_date"))
      .assert(
        "spine_is_complete",
        format!(
          "SELECT 1 FROM (SELECT COUNT(*) AS n FROM {{this}}) WHERE n <> {}",
          calendar.days()
        ),
      ),
  ]
}

// ─── Facts ───────────────────────────────────────────────────────────────────

fn facts() -> Vec<Step> {
  vec![
    // One row per occupied room-night. The nightly rate is the booking's rate
    // plan entry for that night when there is one, else the room type's base.
    Step::mart(
      "fct_room_night",
      "SELECT n.room_id, n.night_date, n.booking_id, b.hotel_id, b.customer_id, b.channel_id,
              COALESCE(rc.rate_cents, r.base_rate_cents) AS rate_cents
       FROM stg_room_night n
       JOIN stg_booking b ON b.booking_id = n.booking_id
       JOIN dim_room r    ON r.room_id = n.room_id
       LEFT JOIN stg_rate_calendar rc
              ON rc.rate_plan_id = b.rate_plan_id AND rc.rate_date = n.night_date
       WHERE n.availability = 'OCCUPIED'",
    )
    .after(["stg_room_night", "stg_booking", "dim_room", "stg_rate_calendar"])
    .assert(
      "unique_room_night",
      "SELECT room_id, night_date FROM {this} GROUP BY room_id, night_date HAVING COUNT(*) > 1",
    )
    .assert("rate_present", not_null("rate_cents")),
    Step::mart(
      "fct_booking_room",
      "SELECT f.booking_id, f.room_id, b.booking_reference, b.booking_status,
              b.checkin_date, b.checkout_date, b.hotel_id, b.customer_id, b.channel_id,
              COUNT(*) AS nights,
              SUM(f.rate_cents) AS revenue_cents
       FROM fct_room_night f
       JOIN stg_booking b ON b.booking_id = f.booking_id
       GROUP BY f.booking_id, f.room_id, b.booking_reference, b.booking_status,
                b.checkin_date, b.checkout_date, b.hotel_id, b.customer_id, b.channel_id",
    )
    .after(["fct_room_night", "stg_booking"])
    .assert(
      "unique_booking_room",
      "SELECT booking_id, room_id FROM {this} GROUP BY booking_id, room_id HAVING COUNT(*) > 1",
    )
    .assert(
      "nights_match_stay",
      "SELECT 1 FROM {this}
       WHERE nights <> CAST(julianday(checkout_date) - julianday(checkin_date) AS INTEGER)",
    ),
    // Degenerate-dimension rollup: descriptive attributes are constant per
    // booking, which the agreement assertion checks instead of trusting min().
    Step::mart(
      "fct_booking",
      "SELECT booking_id,
              MIN(booking_reference) AS booking_reference,
              MIN(booking_status)    AS booking_status,
              MIN(checkin_date)      AS checkin_date,
              MIN(checkout_date)     AS checkout_date,
              MIN(hotel_id)          AS hotel_id,
              MIN(customer_id)       AS customer_id,
              MIN(channel_id)        AS channel_id,
              COUNT(*)               AS room_count,
              SUM(nights)            AS room_nights,
              SUM(revenue_cents)     AS total_amount_cents
       FROM fct_booking_room
       GROUP BY booking_id",
    )
    .after(["fct_booking_room"])
    .assert("unique_booking_id", unique("booking_id"))
    .assert(
      "room_rows_agree",
      "SELECT booking_id FROM fct_booking_room
       GROUP BY booking_id
       HAVING COUNT(DISTINCT booking_reference) > 1
           OR COUNT(DISTINCT booking_status) > 1
           OR COUNT(DISTINCT checkin_date) > 1
           OR COUNT(DISTINCT checkout_date) > 1
           OR COUNT(DISTINCT hotel_id) > 1
           OR COUNT(DISTINCT customer_id) > 1
           OR COUNT(DISTINCT channel_id) > 1",
    ),
    Step::mart(
      "fct_invoice",
      "SELECT i.invoice_id, i.booking_id, i.invoice_status,
              COALESCE(SUM(CASE WHEN l.line_kind = 'ROOM'     THEN l.amount_cents END), 0) AS room_cents,
              COALESCE(SUM(CASE WHEN l.line_kind = 'TAX'      THEN l.amount_cents END), 0) AS tax_cents,
              COALESCE(SUM(CASE WHEN l.line_kind = 'DISCOUNT' THEN l.amount_cents END), 0) AS discount_cents,
              COALESCE(SUM(l.amount_cents), 0) AS total_cents,
              COALESCE(p.amount_cents, 0) AS paid_cents,
              COALESCE((SELECT SUM(r.amount_cents) FROM stg_refund r
                        WHERE r.payment_id = p.payment_id), 0) AS refunded_cents
       FROM stg_invoice i
       LEFT JOIN stg_invoice_line_item l ON l.invoice_id = i.invoice_id
       LEFT JOIN stg_payment p           ON p.invoice_id = i.invoice_id
       GROUP BY i.invoice_id, i.booking_id, i.invoice_status, p.payment_id, p.amount_cents",
    )
    .after(["stg_invoice", "stg_invoice_line_item", "stg_payment", "stg_refund"])
    .assert("unique_invoice_id", unique("invoice_id"))
    .assert(
      "paid_invoices_balance",
      "SELECT invoice_id FROM {this}
       WHERE invoice_status IN ('PAID', 'REFUNDED') AND paid_cents <> total_cents",
    )
    .assert(
      "refunds_within_payment",
      "SELECT invoice_id FROM {this} WHERE refunded_cents > paid_cents",
    ),
  ]
}

// ─── Reports ─────────────────────────────────────────────────────────────────

fn reports() -> Vec<Step> {
  vec![
    Step::mart(
      "rpt_daily_revenue",
      "SELECT c.calendar_date,
              COALESCE(n.rooms_sold, 0)    AS rooms_sold,
              COALESCE(n.revenue_cents, 0) AS revenue_cents,
              COALESCE(b.bookings, 0)      AS bookings
       FROM dim_calendar c
       LEFT JOIN (SELECT night_date, COUNT(*) AS rooms_sold, SUM(rate_cents) AS revenue_cents
                  FROM fct_room_night GROUP BY night_date) n
              ON n.night_date = c.calendar_date
       LEFT JOIN (SELECT checkin_date, COUNT(*) AS bookings
                  FROM fct_booking GROUP BY checkin_date) b
              ON b.checkin_date = c.calendar_date",
    )
    .after(["dim_calendar", "fct_room_night", "fct_booking"])
    .assert("unique_calendar_date", unique("calendar_date"))
    .assert(
      "covers_spine",
      "SELECT 1 WHERE (SELECT COUNT(*) FROM {this}) <> (SELECT COUNT(*) FROM dim_calendar)",
    ),
    Step::mart(
      "rpt_hotel_daily_kpis",
      "WITH inventory AS (
         SELECT hotel_id, COUNT(*) AS rooms_available
         FROM dim_room WHERE room_status = 'ACTIVE' GROUP BY hotel_id
       ),
       sold AS (
         SELECT hotel_id, night_date, COUNT(*) AS rooms_sold, SUM(rate_cents) AS revenue_cents
         FROM fct_room_night GROUP BY hotel_id, night_date
       )
       SELECT h.hotel_id, h.hotel_name, c.calendar_date,
              COALESCE(i.rooms_available, 0) AS rooms_available,
              COALESCE(s.rooms_sold, 0)      AS rooms_sold,
              COALESCE(s.revenue_cents, 0)   AS revenue_cents,
              CASE WHEN COALESCE(i.rooms_available, 0) = 0 THEN 0.0
                   ELSE ROUND(1.0 * COALESCE(s.rooms_sold, 0) / i.rooms_available, 4)
              END AS occupancy,
              CASE WHEN COALESCE(s.rooms_sold, 0) = 0 THEN 0
                   ELSE CAST(ROUND(1.0 * s.revenue_cents / s.rooms_sold) AS INTEGER)
              END AS adr_cents,
              CASE WHEN COALESCE(i.rooms_available, 0) = 0 THEN 0
                   ELSE CAST(ROUND(1.0 * COALESCE(s.revenue_cents, 0) / i.rooms_available) AS INTEGER)
              END AS revpar_cents
       FROM dim_hotel h
       CROSS JOIN dim_calendar c
       LEFT JOIN inventory i ON i.hotel_id = h.hotel_id
       LEFT JOIN sold s      ON s.hotel_id = h.hotel_id AND s.night_date = c.calendar_date",
    )
    .after(["dim_hotel", "dim_calendar", "dim_room", "fct_room_night"])
    .assert(
      "unique_hotel_day",
      "SELECT hotel_id, calendar_date FROM {this}
       GROUP BY hotel_id, calendar_date HAVING COUNT(*) > 1",
    ),
  ]
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeSet;

  use roomnight_core::pipeline::Layer;

  use super::*;
  use crate::schema::TABLES;

  fn range() -> CalendarRange {
    CalendarRange {
      start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
      end:   NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
    }
  }

  #[test]
  fn catalog_is_a_valid_dag() {
    let p = catalog(range(), 1_000).unwrap();
    assert_eq!(p.len(), 2 * TABLES.len() + 10);
    let names: Vec<_> = p.list_steps().map(|s| s.name.as_str()).collect();
    let pos = |n: &str| names.iter().position(|s| *s == n).unwrap();
    assert!(pos("raw_booking") < pos("stg_booking"));
    assert!(pos("stg_booking") < pos("fct_room_night"));
    assert!(pos("fct_booking_room") < pos("fct_booking"));
    assert!(pos("dim_calendar") < pos("rpt_daily_revenue"));
  }

  #[test]
  fn calendar_days_are_inclusive() {
    assert_eq!(range().days(), 366);
  }

  #[test]
  fn inverted_calendar_is_rejected() {
    let r = CalendarRange { start: range().end, end: range().start };
    assert!(catalog(r, 1_000).is_err());
  }

  #[test]
  fn selecting_a_report_pulls_in_its_lineage() {
    let p = catalog(range(), 1_000).unwrap();
    let selected = p.select(&["fct_booking"]).unwrap();
    for step in ["raw_room_night", "stg_room_night", "dim_room", "fct_room_night", "fct_booking_room"] {
      assert!(selected.contains(step), "{step}");
    }
    assert!(!selected.contains("rpt_daily_revenue"));
  }

  #[test]
  fn every_source_table_is_extracted_and_staged() {
    let p = catalog(range(), 1_000).unwrap();
    let sources: BTreeSet<&str> = TABLES.iter().map(|(t, _)| *t).collect();
    let extracted: BTreeSet<&str> = p
      .list_steps()
      .filter(|s| s.layer == Layer::Raw)
      .flat_map(|s| s.sources.iter().map(String::as_str))
      .collect();
    assert_eq!(extracted, sources);
    for table in sources {
      let stg = p.step(&format!("stg_{table}")).unwrap();
      assert_eq!(stg.layer, Layer::Staging);
      assert_eq!(stg.depends_on, vec![format!("raw_{table}")]);
    }
  }

  #[test]
  fn nightly_tables_are_partitioned_by_month_over_the_calendar() {
    let p = catalog(range(), 1_000).unwrap();
    let extract = p.step("raw_room_night").unwrap().extract.clone().unwrap();
    let partition = extract.partition.unwrap();
    assert_eq!(partition.column, "night_date");
    assert_eq!(partition.grain, Grain::Month);
    assert_eq!(partition.end, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
    assert_eq!(extract.chunk_rows, Some(1_000));
    assert!(p.step("raw_booking").unwrap().extract.as_ref().unwrap().partition.is_none());
  }
}
