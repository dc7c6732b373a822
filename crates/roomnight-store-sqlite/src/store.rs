//! [`SqliteWarehouse`]: the SQLite implementation of [`Warehouse`] and
//! [`StepExecutor`].

use std::path::Path;

use rusqlite::types::ValueRef;
use serde_json::{Map, Value};

use roomnight_core::{
  dataset::SeedDataset,
  pipeline::{RunReport, Step},
  store::{LoadMode, LoadReport, StepExecutor, Warehouse},
};

use crate::{
  Error, Result, encode::quote_ident, loader, materialize, runlog, schema::SCHEMA,
};

// ─── Warehouse ───────────────────────────────────────────────────────────────

/// The source tables and the raw, staging and mart namespaces in a single
/// SQLite database.
///
/// Cloning is cheap: the inner connection handle is reference-counted. All
/// statements run on one connection thread, so concurrently scheduled steps
/// are serialized there.
#[derive(Clone)]
pub struct SqliteWarehouse {
  pub(crate) conn: tokio_rusqlite::Connection,
}

impl SqliteWarehouse {
  /// Open (or create) a warehouse at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let warehouse = Self { conn };
    warehouse.init_schema().await?;
    Ok(warehouse)
  }

  /// Open an in-memory warehouse, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let warehouse = Self { conn };
    warehouse.init_schema().await?;
    Ok(warehouse)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Whether a relation (raw table or materialized step) exists.
  pub async fn has_relation(&self, name: &str) -> Result<bool> {
    let name = name.to_owned();
    let found = self
      .conn
      .call(move |conn| {
        let n: i64 = conn.query_row(
          "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
          [&name],
          |r| r.get(0),
        )?;
        Ok(n > 0)
      })
      .await?;
    Ok(found)
  }

  /// Every row of a relation as JSON objects, ordered by all columns so the
  /// output is stable across rebuilds.
  pub async fn dump_table(
    &self,
    name: &str,
    limit: Option<usize>,
  ) -> Result<Vec<Map<String, Value>>> {
    if !self.has_relation(name).await? {
      return Err(Error::UnknownRelation(name.to_owned()));
    }
    let relation = quote_ident(name);
    let limit = limit.map_or(-1, |l| l as i64);

    let rows = self
      .conn
      .call(move |conn| {
        let columns: Vec<String> = {
          let stmt = conn.prepare(&format!("SELECT * FROM {relation} LIMIT 0"))?;
          stmt.column_names().into_iter().map(str::to_owned).collect()
        };
        let order = (1..=columns.len()).map(|i| i.to_string()).collect::<Vec<_>>().join(", ");
        let mut stmt =
          conn.prepare(&format!("SELECT * FROM {relation} ORDER BY {order} LIMIT ?1"))?;
        let rows = stmt.query_map([limit], |r| {
          let mut object = Map::new();
          for (i, column) in columns.iter().enumerate() {
            object.insert(column.clone(), json_value(r.get_ref(i)?));
          }
          Ok(object)
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
      })
      .await?;
    Ok(rows)
  }

  /// Row count of a relation.
  pub async fn count(&self, name: &str) -> Result<u64> {
    if !self.has_relation(name).await? {
      return Err(Error::UnknownRelation(name.to_owned()));
    }
    let relation = quote_ident(name);
    let n = self
      .conn
      .call(move |conn| {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {relation}"), [], |r| r.get(0))?;
        Ok(n)
      })
      .await?;
    Ok(n as u64)
  }
}

/// Blobs render as lowercase hex strings.
fn json_value(v: ValueRef<'_>) -> Value {
  match v {
    ValueRef::Null => Value::Null,
    ValueRef::Integer(i) => Value::from(i),
    ValueRef::Real(f) => Value::from(f),
    ValueRef::Text(t) => Value::from(String::from_utf8_lossy(t).into_owned()),
    ValueRef::Blob(b) => Value::from(hex::encode(b)),
  }
}

// ─── Warehouse impl ──────────────────────────────────────────────────────────

impl Warehouse for SqliteWarehouse {
  type Error = Error;

  async fn load(&self, dataset: &SeedDataset, mode: LoadMode) -> Result<LoadReport> {
    dataset.validate()?;
    let dataset = dataset.clone();
    tracing::info!(%mode, bookings = dataset.bookings.len(), "seed load started");
    let report = self
      .conn
      .call(move |conn| loader::load(conn, &dataset, mode))
      .await?;
    tracing::info!(%mode, rows = report.total(), "seed load committed");
    Ok(report)
  }

  async fn record_run(&self, report: &RunReport) -> Result<()> {
    let report = report.clone();
    self.conn.call(move |conn| runlog::record(conn, &report)).await?;
    Ok(())
  }

  async fn latest_run(&self) -> Result<Option<RunReport>> {
    Ok(self.conn.call(runlog::latest).await?)
  }
}

impl StepExecutor for SqliteWarehouse {
  type Error = Error;

  async fn materialize(&self, step: &Step) -> Result<u64> {
    let step = step.clone();
    let rows = self
      .conn
      .call(move |conn| materialize::materialize(conn, &step))
      .await?;
    Ok(rows)
  }
}
