//! Step declarations.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use super::extract::Extract;

/// The namespace a step materializes into. Ordered: a step may depend only on
/// steps of its own layer or a lower one.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
  Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Layer {
  /// Source-shaped copies of the OLTP tables.
  Raw,
  /// 1:1 typed passthrough of a raw table.
  Staging,
  /// Dimensions, facts and reports.
  Mart,
}

/// A query over a freshly built relation that must return zero rows.
///
/// `{this}` in the SQL is replaced with the name of the relation being built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assertion {
  pub name: String,
  pub sql:  String,
}

impl Assertion {
  pub fn render(&self, relation: &str) -> String { self.sql.replace("{this}", relation) }
}

/// One named, fully-rebuilt transformation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
  /// Also the name of the relation it materializes.
  pub name:       String,
  pub layer:      Layer,
  /// Upstream steps that must have succeeded first.
  pub depends_on: Vec<String>,
  /// Source tables read directly; informational lineage only.
  pub sources:    Vec<String>,
  /// A single SELECT whose result replaces the relation.
  pub sql:        String,
  pub assertions: Vec<Assertion>,
  /// Set on raw steps: how the source is copied in.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub extract:    Option<Extract>,
}

impl Step {
  fn new(name: impl Into<String>, layer: Layer, sql: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      layer,
      depends_on: Vec::new(),
      sources: Vec::new(),
      sql: sql.into(),
      assertions: Vec::new(),
      extract: None,
    }
  }

  /// Copy a source table or query into the raw namespace.
  pub fn raw(name: impl Into<String>, extract: Extract) -> Self {
    let mut step = Self::new(name, Layer::Raw, extract.base_query());
    step.sources.extend(extract.source_table().map(str::to_owned));
    step.extract = Some(extract);
    step
  }

  pub fn staging(name: impl Into<String>, sql: impl Into<String>) -> Self {
    Self::new(name, Layer::Staging, sql)
  }

  pub fn mart(name: impl Into<String>, sql: impl Into<String>) -> Self {
    Self::new(name, Layer::Mart, sql)
  }

  pub fn source(mut self, table: impl Into<String>) -> Self {
    self.sources.push(table.into());
    self
  }

  pub fn after<I, S>(mut self, steps: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.depends_on.extend(steps.into_iter().map(Into::into));
    self
  }

  pub fn assert(mut self, name: impl Into<String>, sql: impl Into<String>) -> Self {
    self.assertions.push(Assertion { name: name.into(), sql: sql.into() });
    self
  }
}
