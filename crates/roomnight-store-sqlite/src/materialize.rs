//! Step materialization by atomic swap.
//!
//! The step's SELECT is written into a scratch table, its assertions are run
//! against the scratch table, and only then is the old relation dropped and
//! the scratch renamed into place. All of it is one transaction, so readers
//! see either the previous relation or the new one, never a partial build.
//!
//! Raw steps fill the scratch table window by window and chunk by chunk
//! instead of from a single SELECT.

use rusqlite::Transaction;

use roomnight_core::{
  Error as CoreError,
  pipeline::{Extract, Step},
};

use crate::{
  encode::quote_ident,
  error::{DbResult, fatal},
};

const SCRATCH_SUFFIX: &str = "__next";

pub(crate) fn materialize(conn: &mut rusqlite::Connection, step: &Step) -> DbResult<u64> {
  let target = quote_ident(&step.name);
  let scratch_name = format!("{}{SCRATCH_SUFFIX}", step.name);
  let scratch = quote_ident(&scratch_name);

  let tx = conn.transaction()?;
  tx.execute_batch(&format!("DROP TABLE IF EXISTS {scratch};"))?;
  match &step.extract {
    Some(extract) => extract_into(&tx, &scratch, extract)?,
    None => tx.execute_batch(&format!(
      "CREATE TABLE {scratch} AS {sql};",
      sql = step.sql.trim().trim_end_matches(';'),
    ))?,
  }

  for assertion in &step.assertions {
    let offending: i64 = tx.query_row(
      &format!("SELECT COUNT(*) FROM ({})", assertion.render(&scratch)),
      [],
      |r| r.get(0),
    )?;
    if offending > 0 {
      tracing::warn!(step = %step.name, assertion = %assertion.name, offending, "assertion failed");
      return Err(fatal(CoreError::AssertionFailed {
        step:      step.name.clone(),
        assertion: assertion.name.clone(),
        rows:      offending as u64,
      }));
    }
  }

  tx.execute_batch(&format!(
    "DROP TABLE IF EXISTS {target};
     ALTER TABLE {scratch} RENAME TO {target};"
  ))?;
  let rows: i64 = tx.query_row(&format!("SELECT COUNT(*) FROM {target}"), [], |r| r.get(0))?;
  tx.commit()?;
  Ok(rows as u64)
}

/// Copy every partition window of the source into `scratch`, one ordered
/// chunk at a time.
fn extract_into(tx: &Transaction<'_>, scratch: &str, extract: &Extract) -> DbResult<()> {
  tx.execute_batch(&format!(
    "CREATE TABLE {scratch} AS SELECT * FROM ({base}) WHERE 0;",
    base = extract.base_query(),
  ))?;

  for window in extract.window_queries().map_err(fatal)? {
    let rows: i64 =
      tx.query_row(&format!("SELECT COUNT(*) FROM ({window})"), [], |r| r.get(0))?;
    let chunks = extract.chunks(rows as u64);
    for chunk in &chunks {
      tx.execute(&format!("INSERT INTO {scratch} {}", extract.chunk_query(&window, chunk)), [])?;
    }
    tracing::debug!(rows, chunks = chunks.len(), window = %window, "extracted window");
  }
  Ok(())
}
