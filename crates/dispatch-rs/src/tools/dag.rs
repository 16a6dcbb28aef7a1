//! Dependency-aware execution ordering.
//!
//! Tools are grouped into execution layers via Kahn's topological sort:
//! tools within a layer are independent and run concurrently, and layer N
//! completes before layer N+1 begins. Dependencies on tools outside the
//! planned set are ignored. Layer contents keep the input order, so the
//! same input always yields the same layering.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;

/// A tool to plan and the tools it waits for.
#[derive(Debug, Clone)]
pub struct PlanNode {
    pub name: String,
    pub depends_on: Vec<String>,
}

impl PlanNode {
    pub fn new(name: impl Into<String>, depends_on: Vec<String>) -> Self {
        Self {
            name: name.into(),
            depends_on,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("dependency cycle among tools: {} of {total} could not be ordered ({})", .unordered.len(), .unordered.join(", "))]
pub struct DependencyCycle {
    /// Tools left on or behind a cycle, in input order.
    pub unordered: Vec<String>,
    pub total: usize,
}

/// Build execution layers from `nodes`.
///
/// Returns an error naming the unorderable tools if the graph has a cycle.
pub fn build_layers(nodes: &[PlanNode]) -> Result<Vec<Vec<String>>, DependencyCycle> {
    if nodes.is_empty() {
        return Ok(vec![]);
    }

    let position: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.name.as_str(), i))
        .collect();

    // Adjacency list and in-degree, counting only in-set dependencies.
    let mut in_degree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for dep in &node.depends_on {
            if let Some(&d) = position.get(dep.as_str())
                && d != i
            {
                in_degree[i] += 1;
                dependents[d].push(i);
            } else if dep == &node.name {
                in_degree[i] += 1;
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut layers: Vec<Vec<String>> = Vec::new();
    let mut processed = 0;

    while !queue.is_empty() {
        // Everything currently queued forms one layer.
        let mut layer: Vec<usize> = queue.drain(..).collect();
        layer.sort_unstable();
        processed += layer.len();

        for &i in &layer {
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }
        layers.push(layer.into_iter().map(|i| nodes[i].name.clone()).collect());
    }

    if processed < nodes.len() {
        return Err(DependencyCycle {
            unordered: (0..nodes.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| nodes[i].name.clone())
                .collect(),
            total: nodes.len(),
        });
    }

    Ok(layers)
}

/// One tool per layer, in input order.
pub fn sequential_layers(nodes: &[PlanNode]) -> Vec<Vec<String>> {
    nodes.iter().map(|n| vec![n.name.clone()]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, deps: &[&str]) -> PlanNode {
        PlanNode::new(name, deps.iter().map(|d| (*d).to_string()).collect())
    }

    #[test]
    fn no_dependencies_single_layer() {
        let layers = build_layers(&[node("a", &[]), node("b", &[])]).unwrap();
        assert_eq!(layers, vec![vec!["a", "b"]]);
    }

    #[test]
    fn linear_dependency_chain() {
        // a -> b -> c
        let layers =
            build_layers(&[node("c", &["b"]), node("b", &["a"]), node("a", &[])]).unwrap();
        assert_eq!(layers, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn diamond_dependency() {
        let layers = build_layers(&[
            node("d", &["b", "c"]),
            node("c", &["a"]),
            node("b", &["a"]),
            node("a", &[]),
        ])
        .unwrap();
        assert_eq!(layers, vec![vec!["a"], vec!["c", "b"], vec!["d"]]);
    }

    #[test]
    fn out_of_set_dependencies_are_ignored() {
        let layers = build_layers(&[node("a", &["ghost"]), node("b", &["a"])]).unwrap();
        assert_eq!(layers, vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn cycle_detection() {
        let err = build_layers(&[node("a", &["b"]), node("b", &["a"]), node("c", &[])])
            .unwrap_err();
        assert_eq!(err.unordered, vec!["a", "b"]);
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        assert!(build_layers(&[node("a", &["a"])]).is_err());
    }

    #[test]
    fn sequential_fallback() {
        let layers = sequential_layers(&[node("a", &["b"]), node("b", &["a"])]);
        assert_eq!(layers, vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn empty_nodes() {
        assert!(build_layers(&[]).unwrap().is_empty());
    }
}
