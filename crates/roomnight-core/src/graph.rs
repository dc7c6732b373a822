//! A small directed dependency graph with deterministic topological order.
//!
//! Used both for pipeline steps and for the foreign-key load order of the
//! seed tables. Ties are broken lexicographically so the order is stable
//! across runs.

use std::collections::{BTreeMap, BTreeSet};

use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct DepGraph {
  /// node → the nodes it depends on.
  deps: BTreeMap<String, BTreeSet<String>>,
}

impl DepGraph {
  pub fn new() -> Self { Self::default() }

  /// Add `node` with its dependencies. Dependencies not yet added as nodes
  /// are added implicitly.
  pub fn add<I, S>(&mut self, node: impl Into<String>, depends_on: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let deps: BTreeSet<String> = depends_on.into_iter().map(Into::into).collect();
    for dep in &deps {
      self.deps.entry(dep.clone()).or_default();
    }
    self.deps.entry(node.into()).or_default().extend(deps);
  }

  pub fn contains(&self, node: &str) -> bool { self.deps.contains_key(node) }

  pub fn nodes(&self) -> impl Iterator<Item = &str> { self.deps.keys().map(String::as_str) }

  pub fn dependencies(&self, node: &str) -> impl Iterator<Item = &str> {
    self.deps.get(node).into_iter().flatten().map(String::as_str)
  }

  /// Kahn's algorithm; parents always precede children.
  pub fn order(&self) -> Result<Vec<String>> {
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = self
      .deps
      .iter()
      .map(|(n, d)| (n.as_str(), d.iter().map(String::as_str).collect()))
      .collect();
    let mut ready: BTreeSet<&str> = remaining
      .iter()
      .filter(|(_, d)| d.is_empty())
      .map(|(n, _)| *n)
      .collect();
    let mut out = Vec::with_capacity(remaining.len());

    while let Some(node) = ready.pop_first() {
      remaining.remove(node);
      out.push(node.to_owned());
      for (child, deps) in remaining.iter_mut() {
        if deps.remove(node) && deps.is_empty() {
          ready.insert(*child);
        }
      }
    }

    if !remaining.is_empty() {
      return Err(Error::Cycle(remaining.keys().map(|s| (*s).to_owned()).collect()));
    }
    Ok(out)
  }

  /// Every node reachable by following dependencies from `node`.
  pub fn ancestors(&self, node: &str) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<&str> = self.dependencies(node).collect();
    while let Some(n) = stack.pop() {
      if seen.insert(n.to_owned()) {
        stack.extend(self.dependencies(n));
      }
    }
    seen
  }

  /// Every node that depends, directly or transitively, on `node`.
  pub fn descendants(&self, node: &str) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut frontier = vec![node.to_owned()];
    while let Some(current) = frontier.pop() {
      for (child, deps) in &self.deps {
        if deps.contains(&current) && seen.insert(child.clone()) {
          frontier.push(child.clone());
        }
      }
    }
    seen
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parents_precede_children_with_stable_ties() {
    let mut g = DepGraph::new();
    g.add("booking", ["hotel", "customer"]);
    g.add("room", ["hotel", "room_type"]);
    g.add("booking_room", ["booking", "room"]);
    assert_eq!(
      g.order().unwrap(),
      vec!["customer", "hotel", "booking", "room_type", "room", "booking_room"]
    );
  }

  #[test]
  fn cycle_is_reported() {
    let mut g = DepGraph::new();
    g.add("a", ["b"]);
    g.add("b", ["c"]);
    g.add("c", ["a"]);
    g.add("d", Vec::<String>::new());
    match g.order() {
      Err(Error::Cycle(nodes)) => assert_eq!(nodes, vec!["a", "b", "c"]),
      other => panic!("expected cycle, got {other:?}"),
    }
  }

  #[test]
  fn ancestors_and_descendants() {
    let mut g = DepGraph::new();
    g.add("b", ["a"]);
    g.add("c", ["b"]);
    g.add("x", ["a"]);
    assert_eq!(g.ancestors("c"), BTreeSet::from(["a".into(), "b".into()]));
    assert_eq!(
      g.descendants("a"),
      BTreeSet::from(["b".into(), "c".into(), "x".into()])
    );
    assert!(g.descendants("c").is_empty());
  }
}
