//! The transformation pipeline: a validated DAG of steps.
//!
//! Steps are declared with their upstream dependencies; [`Pipeline::new`]
//! rejects unknown dependencies, duplicate names, cycles, and dependencies
//! that point at a higher layer. Execution lives in [`run`].

pub mod extract;
pub mod run;
pub mod step;

use std::{
  collections::{BTreeMap, BTreeSet},
  sync::Arc,
};

pub use extract::{Extract, ExtractSource, Grain, Partition};
pub use run::{CancelHandle, RetryPolicy, RunContext, RunReport, StepOutcome, StepState};
pub use step::{Assertion, Layer, Step};

use crate::{Error, Result, graph::DepGraph};

#[derive(Debug, Clone)]
pub struct Pipeline {
  steps: BTreeMap<String, Arc<Step>>,
  graph: DepGraph,
  order: Vec<String>,
}

impl Pipeline {
  pub fn new(steps: impl IntoIterator<Item = Step>) -> Result<Self> {
    let mut by_name: BTreeMap<String, Arc<Step>> = BTreeMap::new();
    for step in steps {
      if by_name.contains_key(&step.name) {
        return Err(Error::DuplicateStep(step.name));
      }
      by_name.insert(step.name.clone(), Arc::new(step));
    }

    let mut graph = DepGraph::new();
    for step in by_name.values() {
      for dep in &step.depends_on {
        let Some(upstream) = by_name.get(dep) else {
          return Err(Error::UnknownStep(dep.clone()));
        };
        if upstream.layer > step.layer {
          return Err(Error::LayerViolation {
            step:             step.name.clone(),
            step_layer:       step.layer.to_string(),
            dependency:       dep.clone(),
            dependency_layer: upstream.layer.to_string(),
          });
        }
      }
      graph.add(step.name.clone(), step.depends_on.iter().cloned());
    }

    let order = graph.order()?;
    Ok(Self { steps: by_name, graph, order })
  }

  /// All steps, parents before children.
  pub fn list_steps(&self) -> impl Iterator<Item = &Arc<Step>> {
    self.order.iter().filter_map(|name| self.steps.get(name))
  }

  pub fn step(&self, name: &str) -> Result<&Arc<Step>> {
    self.steps.get(name).ok_or_else(|| Error::UnknownStep(name.to_owned()))
  }

  pub fn graph(&self) -> &DepGraph { &self.graph }

  pub fn len(&self) -> usize { self.steps.len() }

  pub fn is_empty(&self) -> bool { self.steps.is_empty() }

  /// Resolve a named step-set to run: the named steps plus every upstream
  /// ancestor. An empty selection means every step.
  pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<BTreeSet<String>> {
    if names.is_empty() {
      return Ok(self.steps.keys().cloned().collect());
    }
    let mut selected = BTreeSet::new();
    for name in names {
      let step = self.step(name.as_ref())?;
      selected.insert(step.name.clone());
      selected.extend(self.graph.ancestors(&step.name));
    }
    Ok(selected)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn linear() -> Vec<Step> {
    vec![
      Step::mart("c", "SELECT 1").after(["b"]),
      Step::staging("a", "SELECT 1"),
      Step::mart("b", "SELECT 1").after(["a"]),
    ]
  }

  #[test]
  fn steps_are_listed_in_dependency_order() {
    let p = Pipeline::new(linear()).unwrap();
    let names: Vec<_> = p.list_steps().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
  }

  #[test]
  fn unknown_dependency_is_rejected() {
    let err = Pipeline::new(vec![Step::mart("x", "SELECT 1").after(["missing"])]).unwrap_err();
    assert!(matches!(err, Error::UnknownStep(ref n) if n == "missing"));
  }

  #[test]
  fn duplicate_step_is_rejected() {
    let err = Pipeline::new(vec![
      Step::staging("a", "SELECT 1"),
      Step::staging("a", "SELECT 2"),
    ])
    .unwrap_err();
    assert!(matches!(err, Error::DuplicateStep(_)));
  }

  #[test]
  fn staging_cannot_read_mart() {
    let err = Pipeline::new(vec![
      Step::mart("m", "SELECT 1"),
      Step::staging("s", "SELECT 1").after(["m"]),
    ])
    .unwrap_err();
    assert!(matches!(err, Error::LayerViolation { .. }));
  }

  #[test]
  fn cycles_are_rejected() {
    let err = Pipeline::new(vec![
      Step::mart("a", "SELECT 1").after(["b"]),
      Step::mart("b", "SELECT 1").after(["a"]),
    ])
    .unwrap_err();
    assert!(matches!(err, Error::Cycle(_)));
  }

  #[test]
  fn selection_pulls_in_ancestors() {
    let mut steps = linear();
    steps.push(Step::mart("d", "SELECT 1").after(["a"]));
    let p = Pipeline::new(steps).unwrap();
    assert_eq!(
      p.select(&["b"]).unwrap(),
      BTreeSet::from(["a".to_owned(), "b".to_owned()])
    );
    assert_eq!(p.select::<&str>(&[]).unwrap().len(), 4);
    assert!(p.select(&["nope"]).is_err());
  }
}
