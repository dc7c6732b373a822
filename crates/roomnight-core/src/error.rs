//! Error types for `roomnight-core`.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  /// A natural-key lookup matched zero rows. Always fatal for a load.
  #[error("{entity} not found for key {key:?}")]
  LookupMiss { entity: &'static str, key: String },

  #[error("duplicate {entity} key {key:?}")]
  DuplicateKey { entity: &'static str, key: String },

  #[error("{what}: end {end} must be after start {start}")]
  InvalidDateRange {
    what:  String,
    start: NaiveDate,
    end:   NaiveDate,
  },

  #[error("constraint violation: {0}")]
  Constraint(String),

  #[error("promotion {code} is not valid on {date}")]
  PromotionNotValid { code: String, date: NaiveDate },

  #[error("refunds of {refunded} exceed payment of {payment}")]
  RefundExceedsPayment { payment: Decimal, refunded: Decimal },

  #[error("tax line {name:?} is stale: recorded {recorded}, expected {expected}")]
  StaleTax {
    name:     String,
    recorded: Decimal,
    expected: Decimal,
  },

  #[error("amount {0} does not fit in minor units")]
  MoneyOverflow(Decimal),

  #[error("unknown {domain} value: {value:?}")]
  UnknownStatus { domain: &'static str, value: String },

  /// A stored column value that does not decode to its domain type.
  #[error("cannot decode {what} from {value:?}")]
  Decode { what: &'static str, value: String },

  // ── Pipeline ────────────────────────────────────────────────────────────
  #[error("unknown step: {0}")]
  UnknownStep(String),

  #[error("step {0} is declared more than once")]
  DuplicateStep(String),

  #[error("dependency cycle among: {}", .0.join(", "))]
  Cycle(Vec<String>),

  #[error("step {step} ({step_layer}) cannot depend on {dependency} ({dependency_layer})")]
  LayerViolation {
    step:             String,
    step_layer:       String,
    dependency:       String,
    dependency_layer: String,
  },

  #[error("step {step} refused: dependency {dependency} is {state}")]
  DependencyNotSatisfied {
    step:       String,
    dependency: String,
    state:      String,
  },

  /// An assertion over a freshly built relation returned rows.
  #[error("step {step}: assertion {assertion} failed with {rows} offending rows")]
  AssertionFailed {
    step:      String,
    assertion: String,
    rows:      u64,
  },

  #[error("step {step} failed: {message}")]
  StepFailed { step: String, message: String },

  #[error("run cancelled")]
  Cancelled,

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
