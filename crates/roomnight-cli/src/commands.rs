//! Subcommand implementations.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context as _, bail};
use roomnight_core::{
  dataset::SeedDataset,
  pipeline::{RunContext, RunReport, StepState},
  store::{LoadMode, Warehouse},
};
use roomnight_store_sqlite::{SqliteWarehouse, catalog};

use crate::settings::Settings;

async fn open(settings: &Settings) -> anyhow::Result<SqliteWarehouse> {
  SqliteWarehouse::open(&settings.database_path)
    .await
    .with_context(|| format!("failed to open warehouse at {:?}", settings.database_path))
}

// ─── seed ────────────────────────────────────────────────────────────────────

pub async fn seed(settings: &Settings, reset: bool, dataset: Option<PathBuf>) -> anyhow::Result<()> {
  let dataset = match dataset {
    Some(path) => {
      let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading dataset {}", path.display()))?;
      SeedDataset::from_json(&raw).with_context(|| format!("parsing dataset {}", path.display()))?
    }
    None => SeedDataset::demo().context("parsing bundled demo dataset")?,
  };
  let mode = if reset { LoadMode::Reset } else { LoadMode::Upsert };

  let warehouse = open(settings).await?;
  let report = warehouse.load(&dataset, mode).await.context("seed load failed")?;

  for table in &report.tables {
    println!("{:<22} {:>8}", table.table, table.rows);
  }
  println!("{:<22} {:>8}", format!("total ({mode})"), report.total());
  Ok(())
}

// ─── steps ───────────────────────────────────────────────────────────────────

pub fn steps(settings: &Settings) -> anyhow::Result<()> {
  let pipeline = catalog(settings.calendar(), settings.chunk_rows).context("invalid pipeline")?;
  for step in pipeline.list_steps() {
    let deps = if step.depends_on.is_empty() {
      step.sources.join(", ")
    } else {
      step.depends_on.join(", ")
    };
    println!("{:<24} {:<8} {deps}", step.name, step.layer);
  }
  Ok(())
}

// ─── run ─────────────────────────────────────────────────────────────────────

pub async fn run(settings: &Settings, names: &[String], resume: bool) -> anyhow::Result<()> {
  let pipeline =
    Arc::new(catalog(settings.calendar(), settings.chunk_rows).context("invalid pipeline")?);
  let selection = pipeline.select(names)?;
  let warehouse = Arc::new(open(settings).await?);

  let mut ctx = RunContext::new(pipeline, warehouse.clone())
    .with_retry(settings.retry_policy())
    .with_max_concurrency(settings.max_concurrency);
  if resume && let Some(previous) = warehouse.latest_run().await? {
    tracing::info!(previous = %previous.run_id, "resuming from previous run");
    ctx = ctx.resume_from(&previous);
  }

  let cancel = ctx.cancel_handle();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      tracing::warn!("interrupt received; waiting for running steps to finish");
      cancel.cancel();
    }
  });

  let report = ctx.run(&selection).await;
  warehouse.record_run(&report).await.context("failed to record run")?;
  print_report(&report);

  let failed = report.count(StepState::Failed);
  let pending = report.count(StepState::Pending);
  if failed > 0 || pending > 0 {
    bail!("run {} incomplete: {failed} failed, {pending} not run", report.run_id);
  }
  Ok(())
}

// ─── status ──────────────────────────────────────────────────────────────────

pub async fn status(settings: &Settings) -> anyhow::Result<()> {
  let warehouse = open(settings).await?;
  match warehouse.latest_run().await? {
    Some(report) => print_report(&report),
    None => println!("no runs recorded"),
  }
  Ok(())
}

fn print_report(report: &RunReport) {
  println!(
    "run {} started {} finished {}{}",
    report.run_id,
    report.started_at.to_rfc3339(),
    report.finished_at.to_rfc3339(),
    if report.cancelled { " (cancelled)" } else { "" },
  );
  for o in &report.steps {
    let detail = match (o.state, &o.error, &o.blocked_by) {
      (StepState::Failed, Some(e), _) => e.clone(),
      (StepState::Pending, _, Some(upstream)) => format!("blocked by {upstream}"),
      (StepState::Succeeded, _, _) => format!("{} rows", o.rows.unwrap_or(0)),
      _ => String::new(),
    };
    println!("{:<24} {:<10} {:>2} {detail}", o.step, o.state, o.attempts);
  }
}

// ─── show ────────────────────────────────────────────────────────────────────

pub async fn show(settings: &Settings, relation: &str, limit: usize) -> anyhow::Result<()> {
  let warehouse = open(settings).await?;
  for row in warehouse.dump_table(relation, Some(limit)).await? {
    println!("{}", serde_json::to_string(&row)?);
  }
  Ok(())
}
