//! Entropy statistics
//!
//! The rewrites are judged by how much branch uncertainty they remove:
//! the entropy rate weighs each node's branch entropy by its stationary
//! probability, and the total entropy just sums branch entropy over the
//! graph. Both are reported before and after the transform fixpoint.

use serde::Serialize;

use crate::graph::Graph;

/// Entropy snapshot of one graph state
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EntropySnapshot {
    #[serde(rename = "Entropy Rate")]
    pub entropy_rate: f64,
    #[serde(rename = "Total Entropy")]
    pub total_entropy: f64,
    #[serde(rename = "Nodes")]
    pub nodes: usize,
    #[serde(rename = "Edges")]
    pub edges: usize,
}

/// Start/end entropy bookkeeping for the output file
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EntropyInfo {
    #[serde(rename = "Start")]
    pub start: EntropySnapshot,
    #[serde(rename = "End")]
    pub end: EntropySnapshot,
}

/// Entropy rate of the graph as a Markov chain
///
/// The stationary probability of a node is approximated by its share of
/// total edge traffic; each node contributes its branch entropy weighted
/// by that probability.
pub fn entropy_rate(graph: &Graph) -> f64 {
    let mut total_traffic = 0.0f64;
    for e in graph.edge_ids() {
        total_traffic += graph.edge(e).freq() as f64;
    }
    if total_traffic == 0.0 {
        return 0.0;
    }

    let mut rate = 0.0f64;
    for n in graph.node_ids() {
        let stationary: f64 = graph
            .preds(n)
            .iter()
            .map(|e| graph.edge(*e).freq() as f64)
            .sum::<f64>()
            / total_traffic;
        for e in graph.succs(n) {
            let w = graph.edge(e).weight() as f64;
            if w > 0.0 {
                rate -= stationary * w * w.log2();
            }
        }
    }
    rate
}

/// Unweighted branch entropy summed over every node
pub fn total_entropy(graph: &Graph) -> f64 {
    let mut total = 0.0f64;
    for e in graph.edge_ids() {
        let w = graph.edge(e).weight() as f64;
        if w > 0.0 {
            total -= w * w.log2();
        }
    }
    total
}

/// Capture a snapshot of the current graph state
pub fn snapshot(graph: &Graph) -> EntropySnapshot {
    EntropySnapshot {
        entropy_rate: entropy_rate(graph),
        total_entropy: total_entropy(graph),
        nodes: graph.node_count(),
        edges: graph.edge_count(),
    }
}
