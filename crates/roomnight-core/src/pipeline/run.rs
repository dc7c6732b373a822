//! Pipeline execution.
//!
//! A [`RunContext`] owns everything one run needs: its id, the per-step state
//! map, and a handle to the executor that talks to the warehouse. Steps move
//! `Pending → Running → {Succeeded, Failed}`. A step is started only once all
//! of its dependencies have succeeded; descendants of a failed step stay
//! pending, while unrelated branches keep going.

use std::{
  collections::{BTreeMap, BTreeSet},
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tokio::{sync::Semaphore, task::JoinSet};
use uuid::Uuid;

use super::{Pipeline, Step};
use crate::{Error, Result, store::StepExecutor};

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
  AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
  Pending,
  Running,
  Succeeded,
  Failed,
}

/// Everything recorded about one step in one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
  pub step:        String,
  pub state:       StepState,
  pub attempts:    u32,
  /// Rows in the materialized relation, once succeeded.
  pub rows:        Option<u64>,
  pub error:       Option<String>,
  /// For a step left pending: the failed upstream step that blocked it.
  pub blocked_by:  Option<String>,
  pub started_at:  Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
}

impl StepOutcome {
  fn pending(step: &str) -> Self {
    Self {
      step:        step.to_owned(),
      state:       StepState::Pending,
      attempts:    0,
      rows:        None,
      error:       None,
      blocked_by:  None,
      started_at:  None,
      finished_at: None,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
  pub run_id:      Uuid,
  pub started_at:  DateTime<Utc>,
  pub finished_at: DateTime<Utc>,
  pub cancelled:   bool,
  /// Selected steps in dependency order.
  pub steps:       Vec<StepOutcome>,
}

impl RunReport {
  pub fn outcome(&self, step: &str) -> Option<&StepOutcome> {
    self.steps.iter().find(|o| o.step == step)
  }

  pub fn succeeded(&self) -> bool {
    self.steps.iter().all(|o| o.state == StepState::Succeeded)
  }

  pub fn count(&self, state: StepState) -> usize {
    self.steps.iter().filter(|o| o.state == state).count()
  }
}

// ─── Policy ──────────────────────────────────────────────────────────────────

/// Per-step retry inside one run. The wait before attempt `n + 1` is
/// `backoff * n`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub backoff:      Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self { max_attempts: 1, backoff: Duration::from_millis(500) }
  }
}

/// Stops a run from scheduling further steps. Steps already running finish.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
  pub fn cancel(&self) { self.0.store(true, Ordering::SeqCst) }

  pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::SeqCst) }
}

// ─── Context ─────────────────────────────────────────────────────────────────

struct Attempted {
  attempts: u32,
  result:   Result<u64, String>,
}

pub struct RunContext<E> {
  run_id:          Uuid,
  started_at:      DateTime<Utc>,
  pipeline:        Arc<Pipeline>,
  executor:        Arc<E>,
  retry:           RetryPolicy,
  max_concurrency: usize,
  cancel:          CancelHandle,
  outcomes:        BTreeMap<String, StepOutcome>,
  selected:        BTreeSet<String>,
}

impl<E: StepExecutor> RunContext<E> {
  pub fn new(pipeline: Arc<Pipeline>, executor: Arc<E>) -> Self {
    let outcomes = pipeline
      .list_steps()
      .map(|s| (s.name.clone(), StepOutcome::pending(&s.name)))
      .collect();
    Self {
      run_id: Uuid::new_v4(),
      started_at: Utc::now(),
      pipeline,
      executor,
      retry: RetryPolicy::default(),
      max_concurrency: 4,
      cancel: CancelHandle::default(),
      outcomes,
      selected: BTreeSet::new(),
    }
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  /// Upper bound on steps materializing at once.
  pub fn with_max_concurrency(mut self, n: usize) -> Self {
    self.max_concurrency = n.max(1);
    self
  }

  /// Treat every step that succeeded in `previous` as already materialized.
  pub fn resume_from(mut self, previous: &RunReport) -> Self {
    for done in previous.steps.iter().filter(|o| o.state == StepState::Succeeded) {
      if let Some(outcome) = self.outcomes.get_mut(&done.step) {
        *outcome = done.clone();
      }
    }
    self
  }

  pub fn run_id(&self) -> Uuid { self.run_id }

  pub fn cancel_handle(&self) -> CancelHandle { self.cancel.clone() }

  pub fn status(&self, step: &str) -> Result<StepState> {
    self
      .outcomes
      .get(step)
      .map(|o| o.state)
      .ok_or_else(|| Error::UnknownStep(step.to_owned()))
  }

  /// Run a single step now.
  ///
  /// Refused with [`Error::Cancelled`] once the run has been cancelled.
  /// Refused with [`Error::DependencyNotSatisfied`] unless every dependency
  /// has already succeeded in this context.
  pub async fn run_step(&mut self, name: &str) -> Result<u64> {
    let step = self.pipeline.step(name)?.clone();
    if self.cancel.is_cancelled() {
      return Err(Error::Cancelled);
    }
    for dep in &step.depends_on {
      let state = self.status(dep)?;
      if state != StepState::Succeeded {
        return Err(Error::DependencyNotSatisfied {
          step:       step.name.clone(),
          dependency: dep.clone(),
          state:      state.to_string(),
        });
      }
    }

    self.selected.insert(step.name.clone());
    self.mark_running(&step.name);
    let attempted = execute(self.executor.clone(), step.clone(), self.retry).await;
    let result = attempted.result.clone();
    self.finish(&step.name, attempted);
    result.map_err(|message| Error::StepFailed { step: step.name.clone(), message })
  }

  /// Run every step.
  pub async fn run_all(&mut self) -> RunReport {
    let all: BTreeSet<String> = self.outcomes.keys().cloned().collect();
    self.run(&all).await
  }

  /// Run the selected steps in dependency order, up to `max_concurrency` at a
  /// time. Steps that already succeeded in this context are not re-run. After
  /// a cancel, running steps finish and every step not yet started stays
  /// pending.
  pub async fn run(&mut self, selection: &BTreeSet<String>) -> RunReport {
    self.selected.extend(selection.iter().cloned());
    let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
    let mut tasks: JoinSet<(String, Attempted)> = JoinSet::new();

    tracing::info!(
      run_id = %self.run_id,
      steps = selection.len(),
      max_concurrency = self.max_concurrency,
      "pipeline run started"
    );

    loop {
      if self.cancel.is_cancelled() {
        tracing::warn!(run_id = %self.run_id, "run cancelled; not scheduling further steps");
      } else {
        for step in self.ready(selection) {
          // A step leaves PENDING only once it holds a slot; the rest wait
          // for the next completion and see any cancellation first.
          let Ok(permit) = semaphore.clone().try_acquire_owned() else { break };
          self.mark_running(&step.name);
          let name = step.name.clone();
          let executor = self.executor.clone();
          let retry = self.retry;
          tasks.spawn(async move {
            let _permit = permit;
            // A panicking executor must not take the scheduler down with it.
            let attempted = match tokio::spawn(execute(executor, step, retry)).await {
              Ok(a) => a,
              Err(e) => Attempted {
                attempts: 1,
                result:   Err(format!("step task aborted: {e}")),
              },
            };
            (name, attempted)
          });
        }
      }

      match tasks.join_next().await {
        Some(Ok((name, attempted))) => self.finish(&name, attempted),
        Some(Err(e)) => tracing::error!(run_id = %self.run_id, error = %e, "scheduler task lost"),
        None => break,
      }
    }

    self.mark_blocked();
    let report = self.report();
    tracing::info!(
      run_id = %self.run_id,
      succeeded = report.count(StepState::Succeeded),
      failed = report.count(StepState::Failed),
      pending = report.count(StepState::Pending),
      "pipeline run finished"
    );
    report
  }

  /// Snapshot of every step touched by this context, in dependency order.
  pub fn report(&self) -> RunReport {
    let steps = self
      .pipeline
      .list_steps()
      .filter(|s| self.selected.contains(&s.name))
      .filter_map(|s| self.outcomes.get(&s.name).cloned())
      .collect();
    RunReport {
      run_id: self.run_id,
      started_at: self.started_at,
      finished_at: Utc::now(),
      cancelled: self.cancel.is_cancelled(),
      steps,
    }
  }

  // ── Internals ─────────────────────────────────────────────────────────────

  fn ready(&self, selection: &BTreeSet<String>) -> Vec<Arc<Step>> {
    self
      .pipeline
      .list_steps()
      .filter(|s| selection.contains(&s.name))
      .filter(|s| self.state_of(&s.name) == StepState::Pending)
      .filter(|s| {
        s.depends_on
          .iter()
          .all(|d| self.state_of(d) == StepState::Succeeded)
      })
      .cloned()
      .collect()
  }

  fn state_of(&self, step: &str) -> StepState {
    self.outcomes.get(step).map_or(StepState::Pending, |o| o.state)
  }

  fn mark_running(&mut self, step: &str) {
    tracing::info!(run_id = %self.run_id, step, "step running");
    if let Some(o) = self.outcomes.get_mut(step) {
      o.state = StepState::Running;
      o.started_at = Some(Utc::now());
      o.error = None;
      o.blocked_by = None;
    }
  }

  fn finish(&mut self, step: &str, attempted: Attempted) {
    let Some(o) = self.outcomes.get_mut(step) else { return };
    o.attempts = attempted.attempts;
    o.finished_at = Some(Utc::now());
    match attempted.result {
      Ok(rows) => {
        o.state = StepState::Succeeded;
        o.rows = Some(rows);
      }
      Err(message) => {
        o.state = StepState::Failed;
        o.error = Some(message);
      }
    }
  }

  /// Annotate pending steps with the failed step upstream of them.
  fn mark_blocked(&mut self) {
    let order: Vec<Arc<Step>> = self.pipeline.list_steps().cloned().collect();
    for step in order {
      if self.state_of(&step.name) != StepState::Pending {
        continue;
      }
      let cause = step.depends_on.iter().find_map(|dep| {
        let upstream = self.outcomes.get(dep)?;
        match upstream.state {
          StepState::Failed => Some(dep.clone()),
          _ => upstream.blocked_by.clone(),
        }
      });
      if let Some(o) = self.outcomes.get_mut(&step.name) {
        o.blocked_by = cause;
      }
    }
  }
}

async fn execute<E: StepExecutor>(
  executor: Arc<E>,
  step: Arc<Step>,
  retry: RetryPolicy,
) -> Attempted {
  let max_attempts = retry.max_attempts.max(1);
  let mut attempt = 0;
  loop {
    attempt += 1;
    match executor.materialize(&step).await {
      Ok(rows) => {
        tracing::info!(step = %step.name, attempt, rows, "step succeeded");
        return Attempted { attempts: attempt, result: Ok(rows) };
      }
      Err(e) if attempt < max_attempts => {
        tracing::warn!(step = %step.name, attempt, error = %e, "step failed; retrying");
        tokio::time::sleep(retry.backoff * attempt).await;
      }
      Err(e) => {
        tracing::error!(step = %step.name, attempt, error = %e, "step failed");
        return Attempted { attempts: attempt, result: Err(e.to_string()) };
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{
    collections::HashMap,
    sync::{Mutex, atomic::AtomicUsize},
  };

  use super::*;

  #[derive(Debug, thiserror::Error)]
  #[error("boom: {0}")]
  struct Boom(String);

  /// Records the order steps start and fails the configured ones.
  #[derive(Default)]
  struct FakeExecutor {
    started:         Mutex<Vec<String>>,
    failing:         HashMap<String, usize>,
    calls:           Mutex<HashMap<String, usize>>,
    in_flight:       AtomicUsize,
    peak:            AtomicUsize,
    /// Cancelled by the first step to start.
    cancel_on_start: Mutex<Option<CancelHandle>>,
  }

  impl FakeExecutor {
    fn failing(steps: &[(&str, usize)]) -> Self {
      Self {
        failing: steps.iter().map(|(s, n)| (s.to_string(), *n)).collect(),
        ..Default::default()
      }
    }

    fn started(&self) -> Vec<String> { self.started.lock().unwrap().clone() }
  }

  impl StepExecutor for FakeExecutor {
    type Error = Boom;

    async fn materialize(&self, step: &Step) -> Result<u64, Boom> {
      self.started.lock().unwrap().push(step.name.clone());
      if let Some(handle) = self.cancel_on_start.lock().unwrap().take() {
        handle.cancel();
      }
      let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
      self.peak.fetch_max(now, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(5)).await;
      self.in_flight.fetch_sub(1, Ordering::SeqCst);

      let call = {
        let mut calls = self.calls.lock().unwrap();
        let c = calls.entry(step.name.clone()).or_default();
        *c += 1;
        *c
      };
      match self.failing.get(&step.name) {
        Some(&fails) if call <= fails => Err(Boom(step.name.clone())),
        _ => Ok(1),
      }
    }
  }

  fn pipeline() -> Arc<Pipeline> {
    Arc::new(
      Pipeline::new(vec![
        Step::staging("a", "SELECT 1"),
        Step::mart("b", "SELECT 1").after(["a"]),
        Step::mart("c", "SELECT 1").after(["b"]),
        Step::staging("x", "SELECT 1"),
        Step::mart("y", "SELECT 1").after(["x"]),
      ])
      .unwrap(),
    )
  }

  fn position(order: &[String], step: &str) -> usize {
    order.iter().position(|s| s == step).unwrap()
  }

  #[tokio::test]
  async fn linear_chain_runs_in_order() {
    let exec = Arc::new(FakeExecutor::default());
    let mut ctx = RunContext::new(pipeline(), exec.clone());
    let report = ctx.run_all().await;

    assert!(report.succeeded());
    let order = exec.started();
    assert!(position(&order, "a") < position(&order, "b"));
    assert!(position(&order, "b") < position(&order, "c"));
    assert!(position(&order, "x") < position(&order, "y"));
    assert_eq!(ctx.status("c").unwrap(), StepState::Succeeded);
  }

  #[tokio::test]
  async fn failure_blocks_descendants_only() {
    let exec = Arc::new(FakeExecutor::failing(&[("b", usize::MAX)]));
    let mut ctx = RunContext::new(pipeline(), exec.clone());
    let report = ctx.run_all().await;

    assert_eq!(ctx.status("a").unwrap(), StepState::Succeeded);
    assert_eq!(ctx.status("b").unwrap(), StepState::Failed);
    assert_eq!(ctx.status("c").unwrap(), StepState::Pending);
    assert_eq!(ctx.status("y").unwrap(), StepState::Succeeded);
    assert_eq!(report.outcome("c").unwrap().blocked_by.as_deref(), Some("b"));
    assert!(!exec.started().contains(&"c".to_owned()));
    assert!(!report.succeeded());
  }

  #[tokio::test]
  async fn retry_recovers_transient_failure() {
    let exec = Arc::new(FakeExecutor::failing(&[("a", 1)]));
    let retry = RetryPolicy { max_attempts: 2, backoff: Duration::from_millis(1) };
    let mut ctx = RunContext::new(pipeline(), exec).with_retry(retry);
    let report = ctx.run_all().await;

    assert!(report.succeeded());
    assert_eq!(report.outcome("a").unwrap().attempts, 2);
  }

  #[tokio::test]
  async fn run_step_refuses_unsatisfied_dependency() {
    let exec = Arc::new(FakeExecutor::default());
    let mut ctx = RunContext::new(pipeline(), exec.clone());

    let err = ctx.run_step("b").await.unwrap_err();
    assert!(matches!(err, Error::DependencyNotSatisfied { ref dependency, .. } if dependency == "a"));
    assert!(exec.started().is_empty());

    ctx.run_step("a").await.unwrap();
    ctx.run_step("b").await.unwrap();
    assert_eq!(ctx.status("b").unwrap(), StepState::Succeeded);
  }

  #[tokio::test]
  async fn concurrency_is_bounded() {
    let steps = (0..8).map(|i| Step::staging(format!("s{i}"), "SELECT 1"));
    let p = Arc::new(Pipeline::new(steps).unwrap());
    let exec = Arc::new(FakeExecutor::default());
    let mut ctx = RunContext::new(p, exec.clone()).with_max_concurrency(2);
    assert!(ctx.run_all().await.succeeded());
    assert!(exec.peak.load(Ordering::SeqCst) <= 2);
  }

  #[tokio::test]
  async fn cancelled_run_schedules_nothing_new() {
    let exec = Arc::new(FakeExecutor::default());
    let mut ctx = RunContext::new(pipeline(), exec.clone());
    ctx.cancel_handle().cancel();
    let report = ctx.run_all().await;

    assert!(report.cancelled);
    assert!(exec.started().is_empty());
    assert_eq!(report.count(StepState::Pending), 5);
  }

  #[tokio::test]
  async fn cancel_mid_run_leaves_queued_steps_pending() {
    let steps = (0..8).map(|i| Step::staging(format!("s{i}"), "SELECT 1"));
    let p = Arc::new(Pipeline::new(steps).unwrap());
    let exec = Arc::new(FakeExecutor::default());
    let mut ctx = RunContext::new(p, exec.clone()).with_max_concurrency(1);
    *exec.cancel_on_start.lock().unwrap() = Some(ctx.cancel_handle());
    let report = ctx.run_all().await;

    assert!(report.cancelled);
    assert_eq!(exec.started().len(), 1);
    assert_eq!(report.count(StepState::Succeeded), 1);
    assert_eq!(report.count(StepState::Pending), 7);
    assert!(
      report
        .steps
        .iter()
        .filter(|o| o.state == StepState::Pending)
        .all(|o| o.started_at.is_none())
    );
  }

  #[tokio::test]
  async fn resume_skips_succeeded_steps() {
    let failing = Arc::new(FakeExecutor::failing(&[("b", usize::MAX)]));
    let first = RunContext::new(pipeline(), failing).run_all().await;

    let exec = Arc::new(FakeExecutor::default());
    let mut ctx = RunContext::new(pipeline(), exec.clone()).resume_from(&first);
    let report = ctx.run_all().await;

    assert!(report.succeeded());
    let started = exec.started();
    assert!(!started.contains(&"a".to_owned()));
    assert!(started.contains(&"b".to_owned()) && started.contains(&"c".to_owned()));
  }
}
