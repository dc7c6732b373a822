//! Storage traits.
//!
//! The core crate knows nothing about SQL engines. A backend implements
//! [`Warehouse`] to accept seed loads and keep the run log, and
//! [`StepExecutor`] to materialize pipeline steps.

use std::future::Future;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use crate::{
  dataset::SeedDataset,
  pipeline::{RunReport, Step},
};

/// How a seed load treats existing rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LoadMode {
  /// Insert or update by natural key; rows not in the dataset are kept.
  Upsert,
  /// Empty every raw table first, then load.
  Reset,
}

/// Rows written to one raw table during a load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLoad {
  pub table: String,
  pub rows:  u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadReport {
  pub mode:   LoadMode,
  /// In load order, parents first.
  pub tables: Vec<TableLoad>,
}

impl LoadReport {
  pub fn total(&self) -> u64 { self.tables.iter().map(|t| t.rows).sum() }

  pub fn rows(&self, table: &str) -> Option<u64> {
    self.tables.iter().find(|t| t.table == table).map(|t| t.rows)
  }
}

pub trait Warehouse: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Load the dataset in a single transaction. Any failure rolls the whole
  /// load back.
  fn load<'a>(
    &'a self,
    dataset: &'a SeedDataset,
    mode: LoadMode,
  ) -> impl Future<Output = Result<LoadReport, Self::Error>> + Send + 'a;

  fn record_run<'a>(
    &'a self,
    report: &'a RunReport,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  fn latest_run(
    &self,
  ) -> impl Future<Output = Result<Option<RunReport>, Self::Error>> + Send + '_;
}

/// Materializes one step: builds its relation and swaps it in atomically,
/// returning the row count of the new relation.
pub trait StepExecutor: Send + Sync + 'static {
  type Error: std::error::Error + Send + Sync + 'static;

  fn materialize<'a>(
    &'a self,
    step: &'a Step,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + 'a;
}
