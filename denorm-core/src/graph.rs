//! Dependency graph between model types.
//!
//! Edges point from a source type to the types that embed data derived from
//! it. The graph is built once at load time and must be acyclic: a cycle
//! means some type transitively mirrors itself.

use crate::error::SchemaError;
use crate::schema::{ContainerField, SnapshotSchema};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Static adjacency: source type → directly dependent types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `source → dependent` edges. Repeated edges collapse.
    pub fn register<I, S>(&mut self, source: impl Into<String>, dependents: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self.edges.entry(source.into()).or_default();
        for dependent in dependents {
            entry.insert(dependent.into());
        }
    }

    /// Derive the graph from model declarations and reject cycles.
    pub fn from_schema(schema: &SnapshotSchema) -> Result<Self, SchemaError> {
        let mut graph = Self::new();
        for model in schema.models() {
            for field in &model.fields {
                let source = match field {
                    ContainerField::Mirror { mirror_type, .. } => {
                        match schema.mirror(mirror_type) {
                            Some(spec) => spec.source_type.as_str(),
                            None => continue,
                        }
                    }
                    ContainerField::Computed { source_type, .. } => source_type.as_str(),
                };
                graph.register(source, [model.model.as_str()]);
            }
        }
        graph.topological_order()?;
        Ok(graph)
    }

    /// Direct dependents of `source`.
    pub fn dependents_of<'a>(&'a self, source: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.edges
            .get(source)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    /// Every type transitively dependent on `source`, each exactly once,
    /// in breadth-first order. The visited set is keyed by type, so a type
    /// reachable along several paths (a diamond) still appears once.
    pub fn reachable_from(&self, source: &str) -> Vec<String> {
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<&str> = VecDeque::from([source]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents_of(current) {
                if dependent != source && visited.insert(dependent) {
                    order.push(dependent.to_string());
                    queue.push_back(dependent);
                }
            }
        }
        order
    }

    /// All node names, sources and dependents alike.
    pub fn nodes(&self) -> BTreeSet<&str> {
        self.edges
            .iter()
            .flat_map(|(src, deps)| std::iter::once(src.as_str()).chain(deps.iter().map(String::as_str)))
            .collect()
    }

    /// Kahn's algorithm over every node; fails if any cycle exists.
    pub fn topological_order(&self) -> Result<Vec<String>, SchemaError> {
        let nodes = self.nodes();
        let mut in_degree: BTreeMap<&str, usize> = nodes.iter().map(|n| (*n, 0)).collect();
        for deps in self.edges.values() {
            for dep in deps {
                if let Some(d) = in_degree.get_mut(dep.as_str()) {
                    *d += 1;
                }
            }
        }

        let mut ready: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(node) = ready.pop_front() {
            order.push(node.to_string());
            for dep in self.dependents_of(node) {
                if let Some(d) = in_degree.get_mut(dep) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(dep);
                    }
                }
            }
        }

        if order.len() == nodes.len() {
            Ok(order)
        } else {
            let stuck: Vec<&str> = in_degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(n, _)| n)
                .collect();
            Err(SchemaError::CircularDependency {
                cycle: self.describe_cycle(&stuck),
            })
        }
    }

    /// Walk dependents among the stuck nodes until one repeats.
    fn describe_cycle(&self, stuck: &[&str]) -> String {
        let Some(start) = stuck.first() else {
            return String::new();
        };
        let stuck: BTreeSet<&str> = stuck.iter().copied().collect();
        let mut path = vec![*start];
        let mut current = *start;
        loop {
            let Some(next) = self.dependents_of(current).find(|d| stuck.contains(d)) else {
                break;
            };
            if let Some(pos) = path.iter().position(|p| *p == next) {
                let mut cycle: Vec<&str> = path[pos..].to_vec();
                cycle.push(next);
                return cycle.join(" -> ");
            }
            path.push(next);
            current = next;
        }
        path.join(" -> ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> DependencyGraph {
        let mut g = DependencyGraph::new();
        g.register("Source", ["A", "B"]);
        g.register("A", ["C"]);
        g.register("B", ["C"]);
        g
    }

    #[test]
    fn test_reachable_visits_diamond_once() {
        let reached = diamond().reachable_from("Source");
        assert_eq!(reached, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_reachable_is_transitive() {
        let mut g = DependencyGraph::new();
        g.register("House", ["Tenant"]);
        g.register("Tenant", ["Invoice"]);
        g.register("Invoice", ["Statement"]);
        assert_eq!(g.reachable_from("House"), vec!["Tenant", "Invoice", "Statement"]);
        assert!(g.reachable_from("Statement").is_empty());
    }

    #[test]
    fn test_register_collapses_repeats() {
        let mut g = DependencyGraph::new();
        g.register("House", ["Tenant"]);
        g.register("House", ["Tenant", "Lease"]);
        assert_eq!(g.dependents_of("House").collect::<Vec<_>>(), vec!["Lease", "Tenant"]);
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let order = diamond().topological_order().expect("acyclic");
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("Source") < pos("A"));
        assert!(pos("A") < pos("C"));
        assert!(pos("B") < pos("C"));
    }

    #[test]
    fn test_cycle_is_rejected_with_path() {
        let mut g = diamond();
        g.register("C", ["A"]);
        let err = g.topological_order().unwrap_err();
        match err {
            SchemaError::CircularDependency { cycle } => {
                assert!(cycle.contains("A"));
                assert!(cycle.contains("C"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_self_edge_is_a_cycle() {
        let mut g = DependencyGraph::new();
        g.register("Person", ["Person"]);
        assert!(g.topological_order().is_err());
    }
}
