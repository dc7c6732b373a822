//! The idempotent seed load.
//!
//! Everything happens inside one transaction on the connection thread:
//!
//! 1. optional destructive reset (children first, identity counters cleared);
//! 2. reference data, upserted by natural key;
//! 3. transactional data, with every reference resolved by natural key;
//! 4. derived facts (room-nights, invoices and their line items) rebuilt
//!    from what is now in the raw tables;
//! 5. payments, refunds and invoice statuses.
//!
//! Any lookup miss or constraint violation returns early, dropping the
//! transaction and rolling the whole load back.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::{OptionalExtension as _, Params, Transaction, params};

use roomnight_core::{
  Error as CoreError,
  billing::{
    DiscountRule, InvoiceInput, RoomCharge, TaxRule, build_invoice, check_refunds,
    invoice_status,
  },
  dataset::{BookingSeed, HotelSeed, SeedDataset},
  derive::{BookingSpan, RoomNight, check_exclusive, expand_block, expand_booking},
  status::{BookingStatus, DiscountKind, InvoiceStatus, parse_status},
  store::{LoadMode, LoadReport, TableLoad},
};

use crate::{
  encode::{
    decode_cents, decode_date, decode_decimal, encode_cents, encode_date, encode_decimal,
    encode_dt,
  },
  error::{DbResult, fatal},
  schema::load_plan,
};

/// Rows written per raw table during one load.
#[derive(Default)]
struct Counts(BTreeMap<&'static str, u64>);

impl Counts {
  fn add(&mut self, table: &'static str, rows: usize) {
    *self.0.entry(table).or_default() += rows as u64;
  }

  fn into_report(self, mode: LoadMode, plan: &[String]) -> LoadReport {
    let tables = plan
      .iter()
      .map(|table| TableLoad {
        table: table.clone(),
        rows:  self.0.get(table.as_str()).copied().unwrap_or(0),
      })
      .collect();
    LoadReport { mode, tables }
  }
}

pub(crate) fn load(
  conn: &mut rusqlite::Connection,
  dataset: &SeedDataset,
  mode: LoadMode,
) -> DbResult<LoadReport> {
  let plan = load_plan().map_err(fatal)?;
  let tx = conn.transaction()?;
  let mut counts = Counts::default();

  if mode == LoadMode::Reset {
    reset(&tx, &plan)?;
  }

  load_reference(&tx, dataset, &mut counts)?;
  let bookings = load_bookings(&tx, dataset, &mut counts)?;
  load_room_blocks(&tx, dataset, &mut counts)?;

  rebuild_room_nights(&tx, &mut counts)?;
  rebuild_invoices(&tx, &mut counts)?;
  load_payments(&tx, &bookings, &mut counts)?;
  refresh_invoice_status(&tx)?;

  tx.commit()?;

  let report = counts.into_report(mode, &plan);
  for table in &report.tables {
    tracing::info!(table = %table.table, rows = table.rows, "loaded");
  }
  Ok(report)
}

/// Empty every raw table, children before parents, and restart identities.
fn reset(tx: &Transaction<'_>, plan: &[String]) -> DbResult<()> {
  for table in plan.iter().rev() {
    let deleted = tx.execute(&format!("DELETE FROM {table}"), [])?;
    tracing::debug!(table = %table, deleted, "reset");
  }
  tx.execute("DELETE FROM sqlite_sequence", [])?;
  Ok(())
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Run an upsert whose `RETURNING` clause yields the row id.
fn upsert(tx: &Transaction<'_>, sql: &str, params: impl Params) -> DbResult<i64> {
  Ok(tx.query_row(sql, params, |r| r.get(0))?)
}

/// Resolve a natural key to an id. A miss is fatal.
fn lookup(
  tx: &Transaction<'_>,
  entity: &'static str,
  key: impl Into<String>,
  sql: &str,
  params: impl Params,
) -> DbResult<i64> {
  tx.query_row(sql, params, |r| r.get(0))
    .optional()?
    .ok_or_else(|| fatal(CoreError::LookupMiss { entity, key: key.into() }))
}

fn cents(amount: rust_decimal::Decimal) -> DbResult<i64> { encode_cents(amount).map_err(fatal) }

fn hotel_id(tx: &Transaction<'_>, name: &str) -> DbResult<i64> {
  lookup(tx, "hotel", name, "SELECT hotel_id FROM hotel WHERE name = ?1", [name])
}

fn room_id(tx: &Transaction<'_>, hotel_id: i64, hotel: &str, number: &str) -> DbResult<i64> {
  lookup(
    tx,
    "room",
    format!("{hotel}/{number}"),
    "SELECT room_id FROM room WHERE hotel_id = ?1 AND room_number = ?2",
    params![hotel_id, number],
  )
}

// ─── Reference data ──────────────────────────────────────────────────────────

fn load_reference(tx: &Transaction<'_>, ds: &SeedDataset, counts: &mut Counts) -> DbResult<()> {
  for c in &ds.channels {
    upsert(
      tx,
      "INSERT INTO channel (name, description) VALUES (?1, ?2)
       ON CONFLICT (name) DO UPDATE SET description = excluded.description
       RETURNING channel_id",
      params![c.name, c.description],
    )?;
  }
  counts.add("channel", ds.channels.len());

  for rt in &ds.room_types {
    upsert(
      tx,
      "INSERT INTO room_type (name, max_occupancy, base_rate_cents) VALUES (?1, ?2, ?3)
       ON CONFLICT (name) DO UPDATE SET
         max_occupancy   = excluded.max_occupancy,
         base_rate_cents = excluded.base_rate_cents
       RETURNING room_type_id",
      params![rt.name, rt.max_occupancy, cents(rt.base_rate)?],
    )?;
  }
  counts.add("room_type", ds.room_types.len());

  for c in &ds.customers {
    upsert(
      tx,
      "INSERT INTO customer (email, full_name, phone) VALUES (?1, ?2, ?3)
       ON CONFLICT (email) DO UPDATE SET
         full_name = excluded.full_name,
         phone     = excluded.phone
       RETURNING customer_id",
      params![c.email, c.full_name, c.phone],
    )?;
  }
  counts.add("customer", ds.customers.len());

  for p in &ds.promotions {
    upsert(
      tx,
      "INSERT INTO promotion (code, kind, value, valid_from, valid_to)
       VALUES (?1, ?2, ?3, ?4, ?5)
       ON CONFLICT (code) DO UPDATE SET
         kind       = excluded.kind,
         value      = excluded.value,
         valid_from = excluded.valid_from,
         valid_to   = excluded.valid_to
       RETURNING promotion_id",
      params![
        p.code,
        p.kind.as_ref(),
        encode_decimal(p.value),
        encode_date(p.valid_from),
        encode_date(p.valid_to),
      ],
    )?;
  }
  counts.add("promotion", ds.promotions.len());

  for hotel in &ds.hotels {
    load_hotel(tx, hotel, counts)?;
  }
  Ok(())
}

fn load_hotel(tx: &Transaction<'_>, hotel: &HotelSeed, counts: &mut Counts) -> DbResult<()> {
  let a = &hotel.address;
  let address_id = upsert(
    tx,
    "INSERT INTO address (line1, line2, city, region, postal_code, country)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
     ON CONFLICT (line1, postal_code, country) DO UPDATE SET
       line2  = excluded.line2,
       city   = excluded.city,
       region = excluded.region
     RETURNING address_id",
    params![a.line1, a.line2, a.city, a.region, a.postal_code, a.country],
  )?;
  counts.add("address", 1);

  let hotel_id = upsert(
    tx,
    "INSERT INTO hotel (name, brand, address_id, timezone) VALUES (?1, ?2, ?3, ?4)
     ON CONFLICT (name) DO UPDATE SET
       brand      = excluded.brand,
       address_id = excluded.address_id,
       timezone   = excluded.timezone
     RETURNING hotel_id",
    params![hotel.name, hotel.brand, address_id, hotel.timezone],
  )?;
  counts.add("hotel", 1);

  for room in &hotel.rooms {
    let room_type_id = lookup(
      tx,
      "room_type",
      room.room_type.as_str(),
      "SELECT room_type_id FROM room_type WHERE name = ?1",
      [&room.room_type],
    )?;
    upsert(
      tx,
      "INSERT INTO room (hotel_id, room_type_id, room_number, status) VALUES (?1, ?2, ?3, ?4)
       ON CONFLICT (hotel_id, room_number) DO UPDATE SET
         room_type_id = excluded.room_type_id,
         status       = excluded.status
       RETURNING room_id",
      params![hotel_id, room_type_id, room.number, room.status.as_ref()],
    )?;
  }
  counts.add("room", hotel.rooms.len());

  for plan in &hotel.rate_plans {
    let plan_id = upsert(
      tx,
      "INSERT INTO rate_plan (hotel_id, name, description) VALUES (?1, ?2, ?3)
       ON CONFLICT (hotel_id, name) DO UPDATE SET description = excluded.description
       RETURNING rate_plan_id",
      params![hotel_id, plan.name, plan.description],
    )?;
    for rate in &plan.rates {
      tx.execute(
        "INSERT INTO rate_calendar (rate_plan_id, rate_date, rate_cents) VALUES (?1, ?2, ?3)
         ON CONFLICT (rate_plan_id, rate_date) DO UPDATE SET rate_cents = excluded.rate_cents",
        params![plan_id, encode_date(rate.date), cents(rate.rate)?],
      )?;
    }
    counts.add("rate_calendar", plan.rates.len());
  }
  counts.add("rate_plan", hotel.rate_plans.len());

  for tax in &hotel.tax_fees {
    upsert(
      tx,
      "INSERT INTO tax_fee (hotel_id, name, percent) VALUES (?1, ?2, ?3)
       ON CONFLICT (hotel_id, name) DO UPDATE SET percent = excluded.percent
       RETURNING tax_fee_id",
      params![hotel_id, tax.name, encode_decimal(tax.percent)],
    )?;
  }
  counts.add("tax_fee", hotel.tax_fees.len());

  for e in &hotel.employees {
    upsert(
      tx,
      "INSERT INTO employee (hotel_id, email, full_name, role) VALUES (?1, ?2, ?3, ?4)
       ON CONFLICT (email) DO UPDATE SET
         hotel_id  = excluded.hotel_id,
         full_name = excluded.full_name,
         role      = excluded.role
       RETURNING employee_id",
      params![hotel_id, e.email, e.full_name, e.role],
    )?;
  }
  counts.add("employee", hotel.employees.len());
  Ok(())
}

// ─── Transactional data ──────────────────────────────────────────────────────

/// Upsert every booking with its room assignments, discounts, stay and
/// exception records. Returns `(booking_id, seed)` pairs for the payment pass.
fn load_bookings<'d>(
  tx: &Transaction<'_>,
  ds: &'d SeedDataset,
  counts: &mut Counts,
) -> DbResult<Vec<(i64, &'d BookingSeed)>> {
  let mut loaded = Vec::with_capacity(ds.bookings.len());
  for b in &ds.bookings {
    let id = load_booking(tx, b, counts)?;
    loaded.push((id, b));
  }
  Ok(loaded)
}

fn load_booking(tx: &Transaction<'_>, b: &BookingSeed, counts: &mut Counts) -> DbResult<i64> {
  let customer_id = lookup(
    tx,
    "customer",
    b.customer.as_str(),
    "SELECT customer_id FROM customer WHERE email = ?1",
    [&b.customer],
  )?;
  let hotel_id = hotel_id(tx, &b.hotel)?;
  let channel_id = lookup(
    tx,
    "channel",
    b.channel.as_str(),
    "SELECT channel_id FROM channel WHERE name = ?1",
    [&b.channel],
  )?;
  let rate_plan_id = b
    .rate_plan
    .as_deref()
    .map(|plan| {
      lookup(
        tx,
        "rate_plan",
        format!("{}/{plan}", b.hotel),
        "SELECT rate_plan_id FROM rate_plan WHERE hotel_id = ?1 AND name = ?2",
        params![hotel_id, plan],
      )
    })
    .transpose()?;

  let booking_id = upsert(
    tx,
    "INSERT INTO booking (
       reference, customer_id, hotel_id, channel_id, rate_plan_id,
       status, checkin_date, checkout_date
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
     ON CONFLICT (reference) DO UPDATE SET
       customer_id   = excluded.customer_id,
       hotel_id      = excluded.hotel_id,
       channel_id    = excluded.channel_id,
       rate_plan_id  = excluded.rate_plan_id,
       status        = excluded.status,
       checkin_date  = excluded.checkin_date,
       checkout_date = excluded.checkout_date
     RETURNING booking_id",
    params![
      b.reference,
      customer_id,
      hotel_id,
      channel_id,
      rate_plan_id,
      b.status.as_ref(),
      encode_date(b.checkin),
      encode_date(b.checkout),
    ],
  )?;
  counts.add("booking", 1);

  // Room and discount assignments are replaced as a set.
  tx.execute("DELETE FROM booking_room WHERE booking_id = ?1", [booking_id])?;
  for number in &b.rooms {
    let room_id = room_id(tx, hotel_id, &b.hotel, number)?;
    tx.execute(
      "INSERT INTO booking_room (booking_id, room_id) VALUES (?1, ?2)",
      params![booking_id, room_id],
    )?;
  }
  counts.add("booking_room", b.rooms.len());

  tx.execute("DELETE FROM booking_discount WHERE booking_id = ?1", [booking_id])?;
  for code in &b.promotions {
    let promotion_id = lookup(
      tx,
      "promotion",
      code.as_str(),
      "SELECT promotion_id FROM promotion WHERE code = ?1",
      [code],
    )?;
    tx.execute(
      "INSERT INTO booking_discount (booking_id, promotion_id) VALUES (?1, ?2)",
      params![booking_id, promotion_id],
    )?;
  }
  counts.add("booking_discount", b.promotions.len());

  match &b.stay {
    Some(stay) => {
      upsert(
        tx,
        "INSERT INTO stay (booking_id, status, checked_in_at, checked_out_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (booking_id) DO UPDATE SET
           status         = excluded.status,
           checked_in_at  = excluded.checked_in_at,
           checked_out_at = excluded.checked_out_at
         RETURNING stay_id",
        params![
          booking_id,
          stay.status.as_ref(),
          stay.checked_in_at.map(encode_dt),
          stay.checked_out_at.map(encode_dt),
        ],
      )?;
      counts.add("stay", 1);
    }
    None => {
      tx.execute("DELETE FROM stay WHERE booking_id = ?1", [booking_id])?;
    }
  }

  match &b.cancellation {
    Some(c) => {
      tx.execute(
        "INSERT INTO booking_cancellation (booking_id, cancelled_at, reason) VALUES (?1, ?2, ?3)
         ON CONFLICT (booking_id) DO UPDATE SET
           cancelled_at = excluded.cancelled_at,
           reason       = excluded.reason",
        params![booking_id, encode_dt(c.cancelled_at), c.reason],
      )?;
      counts.add("booking_cancellation", 1);
    }
    None => {
      tx.execute("DELETE FROM booking_cancellation WHERE booking_id = ?1", [booking_id])?;
    }
  }

  match &b.no_show {
    Some(n) => {
      tx.execute(
        "INSERT INTO no_show (booking_id, recorded_at, fee_cents) VALUES (?1, ?2, ?3)
         ON CONFLICT (booking_id) DO UPDATE SET
           recorded_at = excluded.recorded_at,
           fee_cents   = excluded.fee_cents",
        params![booking_id, encode_dt(n.recorded_at), cents(n.fee)?],
      )?;
      counts.add("no_show", 1);
    }
    None => {
      tx.execute("DELETE FROM no_show WHERE booking_id = ?1", [booking_id])?;
    }
  }

  Ok(booking_id)
}

fn load_room_blocks(tx: &Transaction<'_>, ds: &SeedDataset, counts: &mut Counts) -> DbResult<()> {
  for block in &ds.room_blocks {
    let hotel_id = hotel_id(tx, &block.hotel)?;
    let room_id = room_id(tx, hotel_id, &block.hotel, &block.room)?;
    tx.execute(
      "INSERT INTO room_block (room_id, from_date, to_date, reason) VALUES (?1, ?2, ?3, ?4)
       ON CONFLICT (room_id, from_date) DO UPDATE SET
         to_date = excluded.to_date,
         reason  = excluded.reason",
      params![room_id, encode_date(block.from), encode_date(block.to), block.reason],
    )?;
  }
  counts.add("room_block", ds.room_blocks.len());
  Ok(())
}

// ─── Derived: room-nights ────────────────────────────────────────────────────

/// Recompute every room-night from the bookings and blocks now stored.
fn rebuild_room_nights(tx: &Transaction<'_>, counts: &mut Counts) -> DbResult<()> {
  let mut assigned: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
  {
    let mut stmt = tx.prepare("SELECT booking_id, room_id FROM booking_room ORDER BY 1, 2")?;
    let rows = stmt.query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)))?;
    for row in rows {
      let (booking_id, room_id) = row?;
      assigned.entry(booking_id).or_default().push(room_id);
    }
  }

  let mut nights: Vec<RoomNight> = Vec::new();
  {
    let mut stmt = tx.prepare(
      "SELECT booking_id, status, checkin_date, checkout_date FROM booking ORDER BY booking_id",
    )?;
    let rows = stmt.query_map([], |r| {
      Ok((
        r.get::<_, i64>(0)?,
        r.get::<_, String>(1)?,
        r.get::<_, String>(2)?,
        r.get::<_, String>(3)?,
      ))
    })?;
    for row in rows {
      let (booking_id, status, checkin, checkout) = row?;
      let span = BookingSpan {
        booking_id,
        status: parse_status::<BookingStatus>("booking_status", &status).map_err(fatal)?,
        checkin: decode_date(&checkin).map_err(fatal)?,
        checkout: decode_date(&checkout).map_err(fatal)?,
      };
      let rooms = assigned.get(&booking_id).map(Vec::as_slice).unwrap_or_default();
      nights.extend(expand_booking(&span, rooms).map_err(fatal)?);
    }
  }

  {
    let mut stmt = tx.prepare("SELECT room_id, from_date, to_date FROM room_block ORDER BY 1, 2")?;
    let rows = stmt.query_map([], |r| {
      Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
    })?;
    for row in rows {
      let (room_id, from, to) = row?;
      let from = decode_date(&from).map_err(fatal)?;
      let to = decode_date(&to).map_err(fatal)?;
      nights.extend(expand_block(room_id, from, to).map_err(fatal)?);
    }
  }

  check_exclusive(&nights).map_err(fatal)?;

  tx.execute("DELETE FROM room_night", [])?;
  let mut insert = tx.prepare(
    "INSERT INTO room_night (room_id, night_date, availability, booking_id) VALUES (?1, ?2, ?3, ?4)",
  )?;
  for n in &nights {
    insert.execute(params![
      n.room_id,
      encode_date(n.night_date),
      n.availability.as_ref(),
      n.booking_id,
    ])?;
  }
  counts.add("room_night", nights.len());
  Ok(())
}

// ─── Derived: invoices ───────────────────────────────────────────────────────

struct StoredBooking {
  booking_id:   i64,
  reference:    String,
  hotel_id:     i64,
  rate_plan_id: Option<i64>,
  realized:     bool,
  checkin:      String,
  checkout:     String,
}

/// Rebuild the invoice and line items of every realized booking, and void
/// the invoices of bookings that are no longer realized.
fn rebuild_invoices(tx: &Transaction<'_>, counts: &mut Counts) -> DbResult<()> {
  let bookings: Vec<StoredBooking> = {
    let mut stmt = tx.prepare(
      "SELECT b.booking_id, b.reference, b.hotel_id, b.rate_plan_id,
              b.status = 'CONFIRMED' AND EXISTS (SELECT 1 FROM stay s WHERE s.booking_id = b.booking_id),
              b.checkin_date, b.checkout_date
       FROM booking b
       ORDER BY b.booking_id",
    )?;
    let rows = stmt.query_map([], |r| {
      Ok(StoredBooking {
        booking_id:   r.get(0)?,
        reference:    r.get(1)?,
        hotel_id:     r.get(2)?,
        rate_plan_id: r.get(3)?,
        realized:     r.get(4)?,
        checkin:      r.get(5)?,
        checkout:     r.get(6)?,
      })
    })?;
    rows.collect::<Result<_, _>>()?
  };

  for b in &bookings {
    if b.realized {
      let lines = write_invoice(tx, b)?;
      counts.add("invoice", 1);
      counts.add("invoice_line_item", lines);
    } else {
      void_invoice(tx, b.booking_id)?;
    }
  }
  Ok(())
}

fn invoice_input(tx: &Transaction<'_>, b: &StoredBooking) -> DbResult<InvoiceInput> {
  let checkin = decode_date(&b.checkin).map_err(fatal)?;
  let checkout = decode_date(&b.checkout).map_err(fatal)?;

  let mut calendar = BTreeMap::new();
  if let Some(plan_id) = b.rate_plan_id {
    let mut stmt = tx.prepare(
      "SELECT rate_date, rate_cents FROM rate_calendar
       WHERE rate_plan_id = ?1 AND rate_date >= ?2 AND rate_date < ?3",
    )?;
    let rows = stmt.query_map(params![plan_id, b.checkin, b.checkout], |r| {
      Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
    })?;
    for row in rows {
      let (date, rate) = row?;
      calendar.insert(decode_date(&date).map_err(fatal)?, decode_cents(rate));
    }
  }

  let rooms = {
    let mut stmt = tx.prepare(
      "SELECT r.room_id, r.room_number, rt.base_rate_cents
       FROM booking_room br
       JOIN room r       ON r.room_id = br.room_id
       JOIN room_type rt ON rt.room_type_id = r.room_type_id
       WHERE br.booking_id = ?1
       ORDER BY r.room_number",
    )?;
    let rows = stmt.query_map([b.booking_id], |r| {
      Ok(RoomCharge {
        room_id:     r.get(0)?,
        room_number: r.get(1)?,
        base_rate:   decode_cents(r.get(2)?),
        calendar:    calendar.clone(),
      })
    })?;
    rows.collect::<Result<Vec<_>, _>>()?
  };

  let taxes = {
    let mut stmt =
      tx.prepare("SELECT name, percent FROM tax_fee WHERE hotel_id = ?1 ORDER BY name")?;
    let rows = stmt.query_map([b.hotel_id], |r| {
      Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
    })?;
    let mut taxes = Vec::new();
    for row in rows {
      let (name, percent) = row?;
      taxes.push(TaxRule { name, percent: decode_decimal(&percent).map_err(fatal)? });
    }
    taxes
  };

  let discounts = {
    let mut stmt = tx.prepare(
      "SELECT p.code, p.kind, p.value, p.valid_from, p.valid_to
       FROM booking_discount bd
       JOIN promotion p ON p.promotion_id = bd.promotion_id
       WHERE bd.booking_id = ?1
       ORDER BY p.code",
    )?;
    let rows = stmt.query_map([b.booking_id], |r| {
      Ok((
        r.get::<_, String>(0)?,
        r.get::<_, String>(1)?,
        r.get::<_, String>(2)?,
        r.get::<_, String>(3)?,
        r.get::<_, String>(4)?,
      ))
    })?;
    let mut discounts = Vec::new();
    for row in rows {
      let (code, kind, value, from, to) = row?;
      discounts.push(DiscountRule {
        code,
        kind: parse_status::<DiscountKind>("discount_kind", &kind).map_err(fatal)?,
        value: decode_decimal(&value).map_err(fatal)?,
        valid_from: decode_date(&from).map_err(fatal)?,
        valid_to: decode_date(&to).map_err(fatal)?,
      });
    }
    discounts
  };

  Ok(InvoiceInput { checkin, checkout, rooms, taxes, discounts })
}

fn write_invoice(tx: &Transaction<'_>, b: &StoredBooking) -> DbResult<usize> {
  let input = invoice_input(tx, b)?;
  let draft = build_invoice(&input).map_err(fatal)?;
  draft.verify_taxes(&input.taxes).map_err(fatal)?;

  let invoice_id = upsert(
    tx,
    "INSERT INTO invoice (booking_id, status) VALUES (?1, 'OPEN')
     ON CONFLICT (booking_id) DO UPDATE SET status = 'OPEN'
     RETURNING invoice_id",
    [b.booking_id],
  )?;

  tx.execute("DELETE FROM invoice_line_item WHERE invoice_id = ?1", [invoice_id])?;
  let mut insert = tx.prepare(
    "INSERT INTO invoice_line_item (
       invoice_id, line_no, kind, description, quantity, amount_cents
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
  )?;
  for line in &draft.lines {
    insert.execute(params![
      invoice_id,
      line.line_no,
      line.kind.as_ref(),
      line.description,
      line.quantity,
      cents(line.amount)?,
    ])?;
  }
  tracing::debug!(booking = %b.reference, invoice_id, total = %draft.total(), "invoice built");
  Ok(draft.lines.len())
}

fn void_invoice(tx: &Transaction<'_>, booking_id: i64) -> DbResult<()> {
  let invoice_id: Option<i64> = tx
    .query_row("SELECT invoice_id FROM invoice WHERE booking_id = ?1", [booking_id], |r| r.get(0))
    .optional()?;
  if let Some(invoice_id) = invoice_id {
    tx.execute("DELETE FROM invoice_line_item WHERE invoice_id = ?1", [invoice_id])?;
    tx.execute(
      "UPDATE invoice SET status = ?2 WHERE invoice_id = ?1",
      params![invoice_id, InvoiceStatus::Void.as_ref()],
    )?;
  }
  Ok(())
}

// ─── Payments ────────────────────────────────────────────────────────────────

/// Upsert the payment and refunds of each loaded booking. The payment amount
/// is the invoice total at the moment of payment, so every line item must
/// already exist.
fn load_payments(
  tx: &Transaction<'_>,
  bookings: &[(i64, &BookingSeed)],
  counts: &mut Counts,
) -> DbResult<()> {
  for &(booking_id, seed) in bookings {
    let invoice_id: Option<i64> = tx
      .query_row("SELECT invoice_id FROM invoice WHERE booking_id = ?1", [booking_id], |r| {
        r.get(0)
      })
      .optional()?;

    let Some(payment) = &seed.payment else {
      if let Some(invoice_id) = invoice_id {
        tx.execute(
          "DELETE FROM refund WHERE payment_id IN
             (SELECT payment_id FROM payment WHERE invoice_id = ?1)",
          [invoice_id],
        )?;
        tx.execute("DELETE FROM payment WHERE invoice_id = ?1", [invoice_id])?;
      }
      continue;
    };

    let invoice_id = invoice_id.ok_or_else(|| {
      fatal(CoreError::LookupMiss { entity: "invoice", key: seed.reference.clone() })
    })?;
    let total: i64 = tx.query_row(
      "SELECT COALESCE(SUM(amount_cents), 0) FROM invoice_line_item WHERE invoice_id = ?1",
      [invoice_id],
      |r| r.get(0),
    )?;
    let payment_id = upsert(
      tx,
      "INSERT INTO payment (invoice_id, method, amount_cents, paid_at) VALUES (?1, ?2, ?3, ?4)
       ON CONFLICT (invoice_id) DO UPDATE SET
         method       = excluded.method,
         amount_cents = excluded.amount_cents,
         paid_at      = excluded.paid_at
       RETURNING payment_id",
      params![invoice_id, payment.method.as_ref(), total, encode_dt(payment.paid_at)],
    )?;
    counts.add("payment", 1);

    load_refunds(tx, payment_id, seed, counts)?;

    let amounts: Vec<rust_decimal::Decimal> = {
      let mut stmt =
        tx.prepare("SELECT amount_cents FROM refund WHERE payment_id = ?1 ORDER BY refund_id")?;
      let rows = stmt.query_map([payment_id], |r| r.get::<_, i64>(0))?;
      rows.map(|r| r.map(decode_cents)).collect::<Result<_, _>>()?
    };
    check_refunds(decode_cents(total), &amounts).map_err(fatal)?;
  }
  Ok(())
}

/// Refunds are keyed by reference; references no longer listed for the
/// payment are removed.
fn load_refunds(
  tx: &Transaction<'_>,
  payment_id: i64,
  seed: &BookingSeed,
  counts: &mut Counts,
) -> DbResult<()> {
  let wanted: BTreeSet<&str> = seed.refunds.iter().map(|r| r.reference.as_str()).collect();
  let existing: Vec<String> = {
    let mut stmt = tx.prepare("SELECT reference FROM refund WHERE payment_id = ?1")?;
    let rows = stmt.query_map([payment_id], |r| r.get(0))?;
    rows.collect::<Result<_, _>>()?
  };
  for reference in existing.iter().filter(|r| !wanted.contains(r.as_str())) {
    tx.execute("DELETE FROM refund WHERE reference = ?1", [reference])?;
  }

  for refund in &seed.refunds {
    upsert(
      tx,
      "INSERT INTO refund (payment_id, reference, amount_cents, reason, refunded_at)
       VALUES (?1, ?2, ?3, ?4, ?5)
       ON CONFLICT (reference) DO UPDATE SET
         payment_id   = excluded.payment_id,
         amount_cents = excluded.amount_cents,
         reason       = excluded.reason,
         refunded_at  = excluded.refunded_at
       RETURNING refund_id",
      params![
        payment_id,
        refund.reference,
        cents(refund.amount)?,
        refund.reason,
        encode_dt(refund.refunded_at),
      ],
    )?;
  }
  counts.add("refund", seed.refunds.len());
  Ok(())
}

/// Derive OPEN / PAID / REFUNDED for every invoice that is not void. A
/// rebuilt invoice starts out OPEN, so one that was void and is realized
/// again picks up its status here.
fn refresh_invoice_status(tx: &Transaction<'_>) -> DbResult<()> {
  let rows: Vec<(i64, Option<i64>, i64)> = {
    let mut stmt = tx.prepare(
      "SELECT i.invoice_id,
              p.amount_cents,
              COALESCE((SELECT SUM(r.amount_cents) FROM refund r WHERE r.payment_id = p.payment_id), 0)
       FROM invoice i
       LEFT JOIN payment p ON p.invoice_id = i.invoice_id
       WHERE i.status <> 'VOID'",
    )?;
    let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?;
    rows.collect::<Result<_, _>>()?
  };

  for (invoice_id, paid, refunded) in rows {
    let status = invoice_status(paid.map(decode_cents), decode_cents(refunded));
    tx.execute(
      "UPDATE invoice SET status = ?2 WHERE invoice_id = ?1",
      params![invoice_id, status.as_ref()],
    )?;
  }
  Ok(())
}
