//! Persisted run log: one `pipeline_run` row per run and one
//! `pipeline_step_run` row per selected step.

use rusqlite::{OptionalExtension as _, params};

use roomnight_core::{
  pipeline::{RunReport, StepOutcome, StepState},
  status::parse_status,
};

use crate::{
  encode::{decode_dt, decode_uuid, encode_dt, encode_uuid},
  error::{DbResult, fatal},
};

pub(crate) fn record(conn: &mut rusqlite::Connection, report: &RunReport) -> DbResult<()> {
  let run_id = encode_uuid(report.run_id);
  let tx = conn.transaction()?;
  tx.execute(
    "INSERT INTO pipeline_run (run_id, started_at, finished_at, cancelled, succeeded)
     VALUES (?1, ?2, ?3, ?4, ?5)
     ON CONFLICT (run_id) DO UPDATE SET
       finished_at = excluded.finished_at,
       cancelled   = excluded.cancelled,
       succeeded   = excluded.succeeded",
    params![
      run_id,
      encode_dt(report.started_at),
      encode_dt(report.finished_at),
      report.cancelled,
      report.succeeded(),
    ],
  )?;

  tx.execute("DELETE FROM pipeline_step_run WHERE run_id = ?1", [&run_id])?;
  let mut insert = tx.prepare(
    "INSERT INTO pipeline_step_run (
       run_id, seq, step, state, attempts, rows, error, blocked_by, started_at, finished_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
  )?;
  for (seq, o) in report.steps.iter().enumerate() {
    insert.execute(params![
      run_id,
      seq as i64,
      o.step,
      o.state.as_ref(),
      o.attempts,
      o.rows.map(|r| r as i64),
      o.error,
      o.blocked_by,
      o.started_at.map(encode_dt),
      o.finished_at.map(encode_dt),
    ])?;
  }
  drop(insert);
  tx.commit()?;
  Ok(())
}

struct RawStepRun {
  step:        String,
  state:       String,
  attempts:    u32,
  rows:        Option<i64>,
  error:       Option<String>,
  blocked_by:  Option<String>,
  started_at:  Option<String>,
  finished_at: Option<String>,
}

impl RawStepRun {
  fn into_outcome(self) -> roomnight_core::Result<StepOutcome> {
    Ok(StepOutcome {
      step:        self.step,
      state:       parse_status::<StepState>("step_state", &self.state)?,
      attempts:    self.attempts,
      rows:        self.rows.map(|r| r as u64),
      error:       self.error,
      blocked_by:  self.blocked_by,
      started_at:  self.started_at.as_deref().map(decode_dt).transpose()?,
      finished_at: self.finished_at.as_deref().map(decode_dt).transpose()?,
    })
  }
}

/// The most recently started run, if any.
pub(crate) fn latest(conn: &mut rusqlite::Connection) -> DbResult<Option<RunReport>> {
  let run: Option<(String, String, String, bool)> = conn
    .query_row(
      "SELECT run_id, started_at, finished_at, cancelled FROM pipeline_run
       ORDER BY started_at DESC, rowid DESC LIMIT 1",
      [],
      |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
    )
    .optional()?;
  let Some((run_id, started_at, finished_at, cancelled)) = run else {
    return Ok(None);
  };

  let raw: Vec<RawStepRun> = {
    let mut stmt = conn.prepare(
      "SELECT step, state, attempts, rows, error, blocked_by, started_at, finished_at
       FROM pipeline_step_run WHERE run_id = ?1 ORDER BY seq",
    )?;
    let rows = stmt.query_map([&run_id], |r| {
      Ok(RawStepRun {
        step:        r.get(0)?,
        state:       r.get(1)?,
        attempts:    r.get(2)?,
        rows:        r.get(3)?,
        error:       r.get(4)?,
        blocked_by:  r.get(5)?,
        started_at:  r.get(6)?,
        finished_at: r.get(7)?,
      })
    })?;
    rows.collect::<Result<_, _>>()?
  };

  let steps = raw
    .into_iter()
    .map(RawStepRun::into_outcome)
    .collect::<roomnight_core::Result<Vec<_>>>()
    .map_err(fatal)?;

  Ok(Some(RunReport {
    run_id: decode_uuid(&run_id).map_err(fatal)?,
    started_at: decode_dt(&started_at).map_err(fatal)?,
    finished_at: decode_dt(&finished_at).map_err(fatal)?,
    cancelled,
    steps,
  }))
}
