//! Topology analysis over the stage registry.
//!
//! Detects cycles and, for acyclic graphs, assigns each stage its level
//! (longest path from any root) and clusters stages by level into layers.
//! Layers drive the `serial` layout mode.

use std::collections::BTreeMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

/// Analysis result over stage indices `0..n`.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub is_dag: bool,
    /// Stage index → longest-path level (DAG only).
    pub levels: Vec<usize>,
    /// Level → stage indices in that layer, ordered by level (DAG only).
    pub layers: BTreeMap<usize, Vec<usize>>,
}

/// Analyze `n` stages connected by directed `edges`.
pub fn analyze(n: usize, edges: &[(usize, usize)]) -> Topology {
    let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(n, edges.len());
    let nodes: Vec<NodeIndex> = (0..n).map(|i| graph.add_node(i)).collect();
    for &(from, to) in edges {
        graph.add_edge(nodes[from], nodes[to], ());
    }

    let Ok(order) = toposort(&graph, None) else {
        return Topology {
            is_dag: false,
            levels: Vec::new(),
            layers: BTreeMap::new(),
        };
    };

    let mut levels = vec![0usize; n];
    for node in order {
        let level = graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|pred| levels[graph[pred]] + 1)
            .max()
            .unwrap_or(0);
        levels[graph[node]] = level;
    }

    let mut layers: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (idx, &level) in levels.iter().enumerate() {
        layers.entry(level).or_default().push(idx);
    }

    Topology {
        is_dag: true,
        levels,
        layers,
    }
}
