//! Encoding and decoding helpers between domain types and SQLite columns.
//!
//! Dates are `YYYY-MM-DD` text, timestamps RFC 3339 text. Money is integer
//! cents. Rates and percentages that are not money are decimal strings.
//! Status domains use their upper-case string form.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use roomnight_core::{
  Error as CoreError, Result,
  money::{from_cents, to_cents},
};
use rust_decimal::Decimal;
use uuid::Uuid;

// ─── Dates ───────────────────────────────────────────────────────────────────

const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn encode_date(d: NaiveDate) -> String { d.format(DATE_FORMAT).to_string() }

pub fn decode_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|_| decode_error("date", s))
}

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|_| decode_error("timestamp", s))
}

// ─── Numbers ─────────────────────────────────────────────────────────────────

pub fn encode_cents(amount: Decimal) -> Result<i64> { to_cents(amount) }

pub fn decode_cents(cents: i64) -> Decimal { from_cents(cents) }

pub fn encode_decimal(d: Decimal) -> String { d.normalize().to_string() }

pub fn decode_decimal(s: &str) -> Result<Decimal> {
  Decimal::from_str(s).map_err(|_| decode_error("decimal", s))
}

// ─── Identifiers ─────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> {
  Uuid::parse_str(s).map_err(|_| decode_error("uuid", s))
}

/// Double-quote an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String { format!("\"{}\"", name.replace('"', "\"\"")) }

fn decode_error(what: &'static str, value: &str) -> CoreError {
  CoreError::Decode { what, value: value.to_owned() }
}
