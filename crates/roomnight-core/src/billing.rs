//! Invoice construction and payment rollup.
//!
//! Line items are built in a fixed order: ROOM lines first, then one TAX line
//! per tax rule computed from the finished room total, then DISCOUNT lines as
//! negative amounts. The invoice total is the plain sum of every line, and the
//! payment for an invoice is that total at the moment it is built.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  derive::{check_range, night_count, nights},
  money::{percent_of, round_money},
  status::{DiscountKind, InvoiceStatus, LineItemKind},
};

// ─── Inputs ──────────────────────────────────────────────────────────────────

/// Pricing for one room assigned to the booking.
#[derive(Debug, Clone)]
pub struct RoomCharge {
  pub room_id:     i64,
  pub room_number: String,
  /// The room type's default nightly rate.
  pub base_rate:   Decimal,
  /// Rate-plan overrides keyed by night; nights absent here use `base_rate`.
  pub calendar:    BTreeMap<NaiveDate, Decimal>,
}

impl RoomCharge {
  pub fn rate_for(&self, night: NaiveDate) -> Decimal {
    self.calendar.get(&night).copied().unwrap_or(self.base_rate)
  }
}

#[derive(Debug, Clone)]
pub struct TaxRule {
  pub name:    String,
  /// Percentage of the room total, e.g. `12.5`.
  pub percent: Decimal,
}

#[derive(Debug, Clone)]
pub struct DiscountRule {
  pub code:       String,
  pub kind:       DiscountKind,
  pub value:      Decimal,
  pub valid_from: NaiveDate,
  pub valid_to:   NaiveDate,
}

impl DiscountRule {
  pub fn is_valid_on(&self, date: NaiveDate) -> bool {
    self.valid_from <= date && date <= self.valid_to
  }
}

#[derive(Debug, Clone)]
pub struct InvoiceInput {
  pub checkin:   NaiveDate,
  pub checkout:  NaiveDate,
  pub rooms:     Vec<RoomCharge>,
  pub taxes:     Vec<TaxRule>,
  pub discounts: Vec<DiscountRule>,
}

// ─── Output ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
  /// 1-based position within the invoice.
  pub line_no:     u32,
  pub kind:        LineItemKind,
  pub description: String,
  pub quantity:    i64,
  /// Signed; discounts are negative.
  pub amount:      Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceDraft {
  pub lines: Vec<LineItem>,
}

impl InvoiceDraft {
  fn push(&mut self, kind: LineItemKind, description: String, quantity: i64, amount: Decimal) {
    let line_no = self.lines.len() as u32 + 1;
    self.lines.push(LineItem { line_no, kind, description, quantity, amount });
  }

  pub fn sum_of(&self, kind: LineItemKind) -> Decimal {
    self
      .lines
      .iter()
      .filter(|l| l.kind == kind)
      .map(|l| l.amount)
      .sum()
  }

  pub fn room_total(&self) -> Decimal { self.sum_of(LineItemKind::Room) }

  pub fn total(&self) -> Decimal { self.lines.iter().map(|l| l.amount).sum() }

  /// Recompute every TAX line from the current ROOM lines.
  ///
  /// A mismatch means room charges changed after tax was computed; the invoice
  /// has to be rebuilt, not patched.
  pub fn verify_taxes(&self, taxes: &[TaxRule]) -> Result<()> {
    let room_total = self.room_total();
    for line in self.lines.iter().filter(|l| l.kind == LineItemKind::Tax) {
      let Some(rule) = taxes.iter().find(|t| t.name == line.description) else {
        return Err(Error::LookupMiss {
          entity: "tax_fee",
          key:    line.description.clone(),
        });
      };
      let expected = percent_of(room_total, rule.percent);
      if expected != line.amount {
        return Err(Error::StaleTax {
          name: rule.name.clone(),
          recorded: line.amount,
          expected,
        });
      }
    }
    Ok(())
  }
}

// ─── Construction ────────────────────────────────────────────────────────────

/// Build the line items for one realized booking.
pub fn build_invoice(input: &InvoiceInput) -> Result<InvoiceDraft> {
  check_range("invoice stay", input.checkin, input.checkout)?;
  let quantity = night_count(input.checkin, input.checkout);
  let mut draft = InvoiceDraft::default();

  for room in &input.rooms {
    let amount: Decimal = nights(input.checkin, input.checkout)
      .map(|n| round_money(room.rate_for(n)))
      .sum();
    draft.push(
      LineItemKind::Room,
      format!("Room {} x {quantity} nights", room.room_number),
      quantity,
      amount,
    );
  }

  // Tax is computed only once every ROOM line exists.
  let room_total = draft.room_total();
  for tax in &input.taxes {
    draft.push(LineItemKind::Tax, tax.name.clone(), 1, percent_of(room_total, tax.percent));
  }

  // Discounts together never exceed the room total.
  let mut remaining = room_total;
  for discount in &input.discounts {
    if !discount.is_valid_on(input.checkin) {
      return Err(Error::PromotionNotValid {
        code: discount.code.clone(),
        date: input.checkin,
      });
    }
    let raw = match discount.kind {
      DiscountKind::Percent => percent_of(room_total, discount.value),
      DiscountKind::Fixed => round_money(discount.value),
    };
    let applied = raw.min(remaining);
    remaining -= applied;
    draft.push(LineItemKind::Discount, discount.code.clone(), 1, -applied);
  }

  Ok(draft)
}

// ─── Payments ────────────────────────────────────────────────────────────────

/// Reject refunds that are non-positive or that together exceed the payment.
pub fn check_refunds(payment: Decimal, refunds: &[Decimal]) -> Result<()> {
  let mut refunded = Decimal::ZERO;
  for &refund in refunds {
    if refund <= Decimal::ZERO {
      return Err(Error::Constraint(format!("refund amount {refund} must be positive")));
    }
    refunded += refund;
    if refunded > payment {
      return Err(Error::RefundExceedsPayment { payment, refunded });
    }
  }
  Ok(())
}

pub fn invoice_status(payment: Option<Decimal>, refunded: Decimal) -> InvoiceStatus {
  match payment {
    None => InvoiceStatus::Open,
    Some(paid) if refunded > Decimal::ZERO && refunded == paid => InvoiceStatus::Refunded,
    Some(_) => InvoiceStatus::Paid,
  }
}

#[cfg(test)]
mod tests {
  use std::str::FromStr;

  use super::*;

  fn d(s: &str) -> Decimal { Decimal::from_str(s).unwrap() }

  fn date(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
  }

  fn room(id: i64, rate: &str) -> RoomCharge {
    RoomCharge {
      room_id:     id,
      room_number: format!("{id}01"),
      base_rate:   d(rate),
      calendar:    BTreeMap::new(),
    }
  }

  fn input() -> InvoiceInput {
    InvoiceInput {
      checkin:   date(2024, 1, 10),
      checkout:  date(2024, 1, 13),
      rooms:     vec![room(1, "100.00"), room(2, "50.00")],
      taxes:     vec![TaxRule { name: "City Tax".into(), percent: d("12.5") }],
      discounts: vec![],
    }
  }

  #[test]
  fn room_lines_then_tax() {
    let draft = build_invoice(&input()).unwrap();
    let kinds: Vec<_> = draft.lines.iter().map(|l| l.kind).collect();
    assert_eq!(kinds, vec![LineItemKind::Room, LineItemKind::Room, LineItemKind::Tax]);
    assert_eq!(draft.lines[0].amount, d("300.00"));
    assert_eq!(draft.lines[0].quantity, 3);
    assert_eq!(draft.room_total(), d("450.00"));
    // 450 * 12.5% = 56.25
    assert_eq!(draft.lines[2].amount, d("56.25"));
    assert_eq!(draft.total(), d("506.25"));
    assert_eq!(draft.lines.iter().map(|l| l.line_no).collect::<Vec<_>>(), vec![1, 2, 3]);
  }

  #[test]
  fn calendar_rates_are_summed_per_night() {
    let mut inp = input();
    inp.rooms.truncate(1);
    inp.rooms[0].calendar.insert(date(2024, 1, 11), d("120.00"));
    let draft = build_invoice(&inp).unwrap();
    assert_eq!(draft.room_total(), d("320.00"));
  }

  #[test]
  fn discounts_are_negative_and_total_is_plain_sum() {
    let mut inp = input();
    inp.taxes.clear();
    inp.discounts = vec![
      DiscountRule {
        code:       "WINTER10".into(),
        kind:       DiscountKind::Percent,
        value:      d("10"),
        valid_from: date(2024, 1, 1),
        valid_to:   date(2024, 1, 31),
      },
      DiscountRule {
        code:       "LOYAL25".into(),
        kind:       DiscountKind::Fixed,
        value:      d("25"),
        valid_from: date(2023, 1, 1),
        valid_to:   date(2024, 12, 31),
      },
    ];
    let draft = build_invoice(&inp).unwrap();
    assert_eq!(draft.sum_of(LineItemKind::Discount), d("-70.00"));
    assert_eq!(draft.total(), d("380.00"));
  }

  #[test]
  fn fixed_discount_is_capped_at_room_total() {
    let mut inp = input();
    inp.taxes.clear();
    inp.rooms.truncate(1);
    inp.discounts = vec![DiscountRule {
      code:       "COMP".into(),
      kind:       DiscountKind::Fixed,
      value:      d("1000"),
      valid_from: date(2024, 1, 1),
      valid_to:   date(2024, 1, 31),
    }];
    assert_eq!(build_invoice(&inp).unwrap().total(), d("0.00"));
  }

  #[test]
  fn stacked_discounts_share_one_cap() {
    let mut inp = input();
    inp.rooms.truncate(1);
    let comp = |code: &str| DiscountRule {
      code:       code.into(),
      kind:       DiscountKind::Fixed,
      value:      d("300.00"),
      valid_from: date(2024, 1, 1),
      valid_to:   date(2024, 1, 31),
    };
    inp.discounts = vec![comp("COMP-A"), comp("COMP-B")];
    let draft = build_invoice(&inp).unwrap();

    assert_eq!(draft.sum_of(LineItemKind::Discount), d("-300.00"));
    assert_eq!(draft.lines.last().unwrap().amount, d("0.00"));
    // Tax is charged on the room total before discounts: 300 * 12.5%.
    assert_eq!(draft.total(), d("37.50"));
  }

  #[test]
  fn expired_promotion_is_fatal() {
    let mut inp = input();
    inp.discounts = vec![DiscountRule {
      code:       "SUMMER".into(),
      kind:       DiscountKind::Percent,
      value:      d("10"),
      valid_from: date(2024, 6, 1),
      valid_to:   date(2024, 8, 31),
    }];
    assert!(matches!(build_invoice(&inp), Err(Error::PromotionNotValid { .. })));
  }

  #[test]
  fn stale_tax_is_detected() {
    let inp = input();
    let mut draft = build_invoice(&inp).unwrap();
    assert!(draft.verify_taxes(&inp.taxes).is_ok());

    draft.lines[0].amount = d("330.00");
    assert!(matches!(draft.verify_taxes(&inp.taxes), Err(Error::StaleTax { .. })));
  }

  #[test]
  fn refunds_cannot_exceed_payment() {
    assert!(check_refunds(d("100"), &[d("40"), d("60")]).is_ok());
    assert!(matches!(
      check_refunds(d("100"), &[d("40"), d("60.01")]),
      Err(Error::RefundExceedsPayment { .. })
    ));
    assert!(check_refunds(d("100"), &[d("0")]).is_err());
  }

  #[test]
  fn status_follows_payment_and_refunds() {
    assert_eq!(invoice_status(None, Decimal::ZERO), InvoiceStatus::Open);
    assert_eq!(invoice_status(Some(d("10")), Decimal::ZERO), InvoiceStatus::Paid);
    assert_eq!(invoice_status(Some(d("10")), d("4")), InvoiceStatus::Paid);
    assert_eq!(invoice_status(Some(d("10")), d("10")), InvoiceStatus::Refunded);
  }
}
