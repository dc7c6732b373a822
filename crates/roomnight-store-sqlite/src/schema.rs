//! SQL schema for the OLTP source tables and the run log.
//!
//! Raw, staging and mart relations are not declared here; each is created by
//! materializing its pipeline step.

use roomnight_core::{Result, graph::DepGraph};

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- ─── Reference ──────────────────────────────────────────────────────────────

CREATE TABLE IF NOT EXISTS channel (
    channel_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name         TEXT NOT NULL UNIQUE,
    description  TEXT
);

CREATE TABLE IF NOT EXISTS address (
    address_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    line1        TEXT NOT NULL,
    line2        TEXT,
    city         TEXT NOT NULL,
    region       TEXT,
    postal_code  TEXT NOT NULL,
    country      TEXT NOT NULL,
    UNIQUE (line1, postal_code, country)
);

CREATE TABLE IF NOT EXISTS room_type (
    room_type_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    name             TEXT NOT NULL UNIQUE,
    max_occupancy    INTEGER NOT NULL CHECK (max_occupancy > 0),
    base_rate_cents  INTEGER NOT NULL CHECK (base_rate_cents >= 0)
);

CREATE TABLE IF NOT EXISTS customer (
    customer_id  INTEGER PRIMARY KEY AUTOINCREMENT,
    email        TEXT NOT NULL UNIQUE,
    full_name    TEXT NOT NULL,
    phone        TEXT
);

-- value is a decimal string: a percentage for PERCENT, an amount for FIXED.
CREATE TABLE IF NOT EXISTS promotion (
    promotion_id  INTEGER PRIMARY KEY AUTOINCREMENT,
    code          TEXT NOT NULL UNIQUE,
    kind          TEXT NOT NULL CHECK (kind IN ('PERCENT', 'FIXED')),
    value         TEXT NOT NULL,
    valid_from    TEXT NOT NULL,
    valid_to      TEXT NOT NULL,
    CHECK (valid_to >= valid_from)
);

CREATE TABLE IF NOT EXISTS hotel (
    hotel_id    INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    brand       TEXT,
    address_id  INTEGER NOT NULL REFERENCES address(address_id),
    timezone    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS room (
    room_id       INTEGER PRIMARY KEY AUTOINCREMENT,
    hotel_id      INTEGER NOT NULL REFERENCES hotel(hotel_id),
    room_type_id  INTEGER NOT NULL REFERENCES room_type(room_type_id),
    room_number   TEXT NOT NULL,
    status        TEXT NOT NULL CHECK (status IN ('ACTIVE', 'INACTIVE', 'OUT_OF_SERVICE')),
    UNIQUE (hotel_id, room_number)
);

CREATE TABLE IF NOT EXISTS rate_plan (
    rate_plan_id  INTEGER PRIMARY KEY AUTOINCREMENT,
    hotel_id      INTEGER NOT NULL REFERENCES hotel(hotel_id),
    name          TEXT NOT NULL,
    description   TEXT,
    UNIQUE (hotel_id, name)
);

CREATE TABLE IF NOT EXISTS rate_calendar (
    rate_plan_id  INTEGER NOT NULL REFERENCES rate_plan(rate_plan_id),
    rate_date     TEXT NOT NULL,
    rate_cents    INTEGER NOT NULL CHECK (rate_cents >= 0),
    PRIMARY KEY (rate_plan_id, rate_date)
);

-- percent is a decimal string.
CREATE TABLE IF NOT EXISTS tax_fee (
    tax_fee_id  INTEGER PRIMARY KEY AUTOINCREMENT,
    hotel_id    INTEGER NOT NULL REFERENCES hotel(hotel_id),
    name        TEXT NOT NULL,
    percent     TEXT NOT NULL,
    UNIQUE (hotel_id, name)
);

CREATE TABLE IF NOT EXISTS employee (
    employee_id  INTEGER PRIMARY KEY AUTOINCREMENT,
    hotel_id     INTEGER NOT NULL REFERENCES hotel(hotel_id),
    email        TEXT NOT NULL UNIQUE,
    full_name    TEXT NOT NULL,
    role         TEXT NOT NULL
);

-- ─── Transactional ──────────────────────────────────────────────────────────

CREATE TABLE IF NOT EXISTS booking (
    booking_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    reference      TEXT NOT NULL UNIQUE,
    customer_id    INTEGER NOT NULL REFERENCES customer(customer_id),
    hotel_id       INTEGER NOT NULL REFERENCES hotel(hotel_id),
    channel_id     INTEGER NOT NULL REFERENCES channel(channel_id),
    rate_plan_id   INTEGER REFERENCES rate_plan(rate_plan_id),
    status         TEXT NOT NULL CHECK (status IN ('CONFIRMED', 'CANCELLED', 'NO_SHOW')),
    checkin_date   TEXT NOT NULL,
    checkout_date  TEXT NOT NULL,
    CHECK (checkout_date > checkin_date)
);

CREATE TABLE IF NOT EXISTS booking_room (
    booking_id  INTEGER NOT NULL REFERENCES booking(booking_id),
    room_id     INTEGER NOT NULL REFERENCES room(room_id),
    PRIMARY KEY (booking_id, room_id)
);

CREATE TABLE IF NOT EXISTS booking_discount (
    booking_id    INTEGER NOT NULL REFERENCES booking(booking_id),
    promotion_id  INTEGER NOT NULL REFERENCES promotion(promotion_id),
    PRIMARY KEY (booking_id, promotion_id)
);

CREATE TABLE IF NOT EXISTS stay (
    stay_id         INTEGER PRIMARY KEY AUTOINCREMENT,
    booking_id      INTEGER NOT NULL UNIQUE REFERENCES booking(booking_id),
    status          TEXT NOT NULL CHECK (status IN ('CHECKED_IN', 'CHECKED_OUT')),
    checked_in_at   TEXT,
    checked_out_at  TEXT,
    CHECK (checked_in_at IS NULL OR checked_out_at IS NULL OR checked_out_at >= checked_in_at)
);

CREATE TABLE IF NOT EXISTS booking_cancellation (
    booking_id    INTEGER PRIMARY KEY REFERENCES booking(booking_id),
    cancelled_at  TEXT NOT NULL,
    reason        TEXT
);

CREATE TABLE IF NOT EXISTS no_show (
    booking_id   INTEGER PRIMARY KEY REFERENCES booking(booking_id),
    recorded_at  TEXT NOT NULL,
    fee_cents    INTEGER NOT NULL CHECK (fee_cents >= 0)
);

CREATE TABLE IF NOT EXISTS room_block (
    room_id    INTEGER NOT NULL REFERENCES room(room_id),
    from_date  TEXT NOT NULL,
    to_date    TEXT NOT NULL,
    reason     TEXT,
    PRIMARY KEY (room_id, from_date),
    CHECK (to_date > from_date)
);

-- ─── Derived ────────────────────────────────────────────────────────────────
-- Rebuilt by every load. Never edited by hand.

CREATE TABLE IF NOT EXISTS room_night (
    room_id       INTEGER NOT NULL REFERENCES room(room_id),
    night_date    TEXT NOT NULL,
    availability  TEXT NOT NULL CHECK (availability IN ('AVAILABLE', 'OCCUPIED', 'BLOCKED')),
    booking_id    INTEGER REFERENCES booking(booking_id),
    PRIMARY KEY (room_id, night_date),
    CHECK ((availability = 'OCCUPIED') = (booking_id IS NOT NULL))
);

CREATE TABLE IF NOT EXISTS invoice (
    invoice_id  INTEGER PRIMARY KEY AUTOINCREMENT,
    booking_id  INTEGER NOT NULL UNIQUE REFERENCES booking(booking_id),
    status      TEXT NOT NULL CHECK (status IN ('OPEN', 'PAID', 'VOID', 'REFUNDED'))
);

CREATE TABLE IF NOT EXISTS invoice_line_item (
    invoice_id    INTEGER NOT NULL REFERENCES invoice(invoice_id),
    line_no       INTEGER NOT NULL CHECK (line_no > 0),
    kind          TEXT NOT NULL CHECK (kind IN ('ROOM', 'SERVICE', 'TAX', 'DISCOUNT', 'OTHER')),
    description   TEXT NOT NULL,
    quantity      INTEGER NOT NULL,
    amount_cents  INTEGER NOT NULL,
    PRIMARY KEY (invoice_id, line_no),
    CHECK (kind <> 'DISCOUNT' OR amount_cents <= 0)
);

CREATE TABLE IF NOT EXISTS payment (
    payment_id    INTEGER PRIMARY KEY AUTOINCREMENT,
    invoice_id    INTEGER NOT NULL UNIQUE REFERENCES invoice(invoice_id),
    method        TEXT NOT NULL CHECK (method IN ('CARD', 'CASH', 'BANK_TRANSFER')),
    amount_cents  INTEGER NOT NULL CHECK (amount_cents >= 0),
    paid_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS refund (
    refund_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    payment_id    INTEGER NOT NULL REFERENCES payment(payment_id),
    reference     TEXT NOT NULL UNIQUE,
    amount_cents  INTEGER NOT NULL CHECK (amount_cents > 0),
    reason        TEXT,
    refunded_at   TEXT NOT NULL
);

-- ─── Run log ────────────────────────────────────────────────────────────────

CREATE TABLE IF NOT EXISTS pipeline_run (
    run_id       TEXT PRIMARY KEY,
    started_at   TEXT NOT NULL,
    finished_at  TEXT NOT NULL,
    cancelled    INTEGER NOT NULL,
    succeeded    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS pipeline_step_run (
    run_id       TEXT NOT NULL REFERENCES pipeline_run(run_id),
    seq          INTEGER NOT NULL,
    step         TEXT NOT NULL,
    state        TEXT NOT NULL CHECK (state IN ('PENDING', 'RUNNING', 'SUCCEEDED', 'FAILED')),
    attempts     INTEGER NOT NULL,
    rows         INTEGER,
    error        TEXT,
    blocked_by   TEXT,
    started_at   TEXT,
    finished_at  TEXT,
    PRIMARY KEY (run_id, step)
);

CREATE INDEX IF NOT EXISTS booking_hotel_idx      ON booking(hotel_id);
CREATE INDEX IF NOT EXISTS room_night_booking_idx ON room_night(booking_id);
CREATE INDEX IF NOT EXISTS pipeline_run_start_idx ON pipeline_run(started_at);

PRAGMA user_version = 1;
";

/// Every raw table with the tables its foreign keys point at.
pub const TABLES: &[(&str, &[&str])] = &[
  ("channel", &[]),
  ("address", &[]),
  ("room_type", &[]),
  ("customer", &[]),
  ("promotion", &[]),
  ("hotel", &["address"]),
  ("room", &["hotel", "room_type"]),
  ("rate_plan", &["hotel"]),
  ("rate_calendar", &["rate_plan"]),
  ("tax_fee", &["hotel"]),
  ("employee", &["hotel"]),
  ("booking", &["customer", "hotel", "channel", "rate_plan"]),
  ("booking_room", &["booking", "room"]),
  ("booking_discount", &["booking", "promotion"]),
  ("stay", &["booking"]),
  ("booking_cancellation", &["booking"]),
  ("no_show", &["booking"]),
  ("room_block", &["room"]),
  ("room_night", &["room", "booking"]),
  ("invoice", &["booking"]),
  ("invoice_line_item", &["invoice"]),
  ("payment", &["invoice"]),
  ("refund", &["payment"]),
];

/// Raw tables, parents before children. A destructive reset empties them in
/// the reverse order.
pub fn load_plan() -> Result<Vec<String>> {
  let mut graph = DepGraph::new();
  for (table, parents) in TABLES {
    graph.add(*table, parents.iter().copied());
  }
  graph.order()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn position(plan: &[String], table: &str) -> usize {
    plan.iter().position(|t| t == table).unwrap()
  }

  #[test]
  fn plan_puts_parents_first() {
    let plan = load_plan().unwrap();
    assert_eq!(plan.len(), TABLES.len());
    for (table, parents) in TABLES {
      for parent in *parents {
        assert!(position(&plan, parent) < position(&plan, table), "{parent} before {table}");
      }
    }
  }

  #[test]
  fn plan_is_deterministic() {
    let plan = load_plan().unwrap();
    assert_eq!(&plan[..3], ["address", "channel", "customer"]);
    assert_eq!(plan, load_plan().unwrap());
  }
}
