//! Post-transform invariant checks
//!
//! Transforms never raise for "not applicable"; these checks are the only
//! place structural damage surfaces. They run after profile read and
//! after each pipeline stage, naming the stage that broke the graph.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::graph::{Graph, NodeId};

#[derive(Debug, Error)]
pub enum InvariantError {
    #[error("{step}: graph is empty")]
    EmptyGraph { step: String },
    #[error("{step}: edge {edge} references a node outside the visible graph")]
    OrphanEdge { step: String, edge: u64 },
    #[error("{step}: node {node} is unreachable from the program entrance")]
    NodeUnreachable { step: String, node: u64 },
    #[error("{step}: node {node} cannot reach a program terminator")]
    DisconnectedGraph { step: String, node: u64 },
    #[error("{step}: outgoing probabilities of node {node} sum to {sum}")]
    NonUnitProbabilitySum { step: String, node: u64, sum: f64 },
    #[error("{step}: flow through node {node} is unbalanced by {delta}")]
    UnbalancedFlow { step: String, node: u64, delta: i64 },
}

/// Run the structural checks
///
/// In segmentation mode the sum-to-one check is skipped: virtualized
/// cycles legitimately absorb probability mass.
pub fn verify(graph: &Graph, step: &str, segmentation: bool) -> Result<(), InvariantError> {
    if graph.is_empty() {
        return Err(InvariantError::EmptyGraph {
            step: step.to_string(),
        });
    }

    // every visible edge must connect visible nodes; imaginary edges are
    // exempt because thread-exit edges may anchor into virtualized code
    for e in graph.edge_ids() {
        let edge = graph.edge(e);
        if edge.is_imaginary() {
            continue;
        }
        if !graph.contains_node(edge.src) || !graph.contains_node(edge.snk) {
            return Err(InvariantError::OrphanEdge {
                step: step.to_string(),
                edge: e.0,
            });
        }
    }

    // forward reachability from the program entrance
    if let Some(entry) = graph.entry_node() {
        let covered = flood(graph, entry, true);
        for n in graph.node_ids() {
            if !covered.contains(&n) {
                return Err(InvariantError::NodeUnreachable {
                    step: step.to_string(),
                    node: n.0,
                });
            }
        }
    }

    // backward reachability from the program terminators
    if let Some(exit) = graph.exit_node() {
        let covered = flood(graph, exit, false);
        for n in graph.node_ids() {
            if !covered.contains(&n) {
                return Err(InvariantError::DisconnectedGraph {
                    step: step.to_string(),
                    node: n.0,
                });
            }
        }
    }

    if !segmentation {
        for n in graph.node_ids() {
            let succs = graph.succs(n);
            if succs.is_empty() {
                continue;
            }
            // nodes feeding the program exit are exempt
            if succs.iter().any(|e| graph.edge(*e).is_imaginary()) {
                continue;
            }
            let sum: f64 = succs.iter().map(|e| graph.edge(*e).weight() as f64).sum();
            if !(0.999..=1.001).contains(&sum) {
                return Err(InvariantError::NonUnitProbabilitySum {
                    step: step.to_string(),
                    node: n.0,
                    sum,
                });
            }
        }
    }

    Ok(())
}

/// Check flow conservation after the balancing pass, to within one unit
/// of integer rounding per node
pub fn verify_flow(graph: &Graph, step: &str) -> Result<(), InvariantError> {
    for n in graph.node_ids() {
        let node = graph.node(n);
        if node.is_imaginary() {
            continue;
        }
        let preds = graph.preds(n);
        let succs = graph.succs(n);
        if preds.is_empty() || succs.is_empty() {
            continue;
        }
        if preds.iter().chain(succs.iter()).any(|e| graph.edge(*e).is_imaginary()) {
            continue;
        }
        let inflow: i64 = preds.iter().map(|e| graph.edge(*e).freq() as i64).sum();
        let outflow: i64 = succs.iter().map(|e| graph.edge(*e).freq() as i64).sum();
        let delta = inflow - outflow;
        if delta.abs() > 1 {
            return Err(InvariantError::UnbalancedFlow {
                step: step.to_string(),
                node: n.0,
                delta,
            });
        }
    }
    Ok(())
}

fn flood(graph: &Graph, start: NodeId, forward: bool) -> BTreeSet<NodeId> {
    let mut covered = BTreeSet::new();
    let mut queue = vec![start];
    while let Some(n) = queue.pop() {
        if !covered.insert(n) {
            continue;
        }
        let edges = if forward {
            graph.succs(n)
        } else {
            graph.preds(n)
        };
        for e in edges {
            let next = if forward {
                graph.edge(e).snk
            } else {
                graph.edge(e).src
            };
            if !covered.contains(&next) {
                queue.push(next);
            }
        }
    }
    covered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testutil::{chain_graph, weigh};
    use crate::graph::EdgeKind;

    fn anchored() -> Graph {
        let (mut g, ids) = chain_graph(&[(0, 1, 5), (1, 2, 5)]);
        weigh(&mut g);
        let entry = g.add_imaginary_node();
        g.add_edge(entry, ids[&0], EdgeKind::Imaginary);
        let exit = g.add_imaginary_node();
        g.add_edge(ids[&2], exit, EdgeKind::Imaginary);
        g
    }

    #[test]
    fn test_verify_clean_graph() {
        let g = anchored();
        assert!(verify(&g, "test", false).is_ok());
        assert!(verify_flow(&g, "test").is_ok());
    }

    #[test]
    fn test_unreachable_node_detected() {
        let mut g = anchored();
        g.add_control_node(vec![crate::ir::BlockId(99)]);
        let err = verify(&g, "test", false).unwrap_err();
        assert!(matches!(err, InvariantError::NodeUnreachable { .. }));
    }

    #[test]
    fn test_bad_probability_sum_detected() {
        let (mut g, ids) = chain_graph(&[(0, 1, 5), (0, 2, 5)]);
        weigh(&mut g);
        let entry = g.add_imaginary_node();
        g.add_edge(entry, ids[&0], EdgeKind::Imaginary);
        for t in [1i64, 2] {
            let exit = g.add_imaginary_node();
            g.add_edge(ids[&t], exit, EdgeKind::Imaginary);
        }
        // corrupt one branch weight
        let e = g.find_edge_between(ids[&0], ids[&1]).unwrap();
        g.edge_mut(e).set_weight(0.9);
        let err = verify(&g, "test", false).unwrap_err();
        assert!(matches!(err, InvariantError::NonUnitProbabilitySum { .. }));
        // segmentation mode tolerates it
        assert!(verify(&g, "test", true).is_ok());
    }

    #[test]
    fn test_unbalanced_flow_detected() {
        let (mut g, _ids) = chain_graph(&[(0, 1, 10), (1, 2, 5)]);
        weigh(&mut g);
        let err = verify_flow(&g, "test").unwrap_err();
        assert!(matches!(err, InvariantError::UnbalancedFlow { delta: 5, .. }));
    }
}
