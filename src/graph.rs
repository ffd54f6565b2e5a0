use std::fmt;
use std::hash::Hash;

use indexmap::{IndexMap, IndexSet};
use thiserror::Error;

/// A graph handed to [`topological_order`] contained a cycle.
#[derive(Debug, Error)]
#[error("graph has a cycle among: {}", nodes.join(", "))]
pub struct CycleError {
    pub nodes: Vec<String>,
}

/// Return the graph's keys ordered so every node appears after all of its
/// dependencies.
///
/// Ties are broken by key insertion order, so the result is deterministic
/// for a given graph. Dependencies that are not themselves keys cannot be
/// ordered and are treated as already satisfied.
pub fn topological_order<K>(graph: &IndexMap<K, IndexSet<K>>) -> Result<Vec<K>, CycleError>
where
    K: Clone + Eq + Hash + fmt::Display,
{
    let mut order: Vec<K> = Vec::with_capacity(graph.len());
    let mut emitted: IndexSet<&K> = IndexSet::with_capacity(graph.len());

    while emitted.len() < graph.len() {
        let before = emitted.len();
        for (node, dependencies) in graph {
            if emitted.contains(node) {
                continue;
            }
            if dependencies
                .iter()
                .all(|dep| emitted.contains(dep) || !graph.contains_key(dep))
            {
                emitted.insert(node);
                order.push(node.clone());
            }
        }
        if emitted.len() == before {
            let nodes = graph
                .keys()
                .filter(|node| !emitted.contains(*node))
                .map(ToString::to_string)
                .collect();
            return Err(CycleError { nodes });
        }
    }

    Ok(order)
}
