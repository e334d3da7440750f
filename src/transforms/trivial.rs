//! Trivial merge
//!
//! Collapses straight-line chains: a node with exactly one certain
//! successor whose successor has exactly one predecessor and one
//! successor merges into it, and the chain keeps extending while the
//! shape repeats.

use crate::graph::{Graph, NodeId};

use super::virtualize::Subgraph;

const CERTAIN: f32 = 0.9999;

/// Grow a straight-line chain starting at `source`
///
/// Returns an empty subgraph when no merge applies. Conditions per step:
/// the source has exactly one successor taken with certainty, the sink
/// has exactly one predecessor and one successor, the sink does not loop
/// back to the source, and both ends have at least one predecessor and
/// one successor overall.
pub fn find(graph: &Graph, source: NodeId) -> Subgraph {
    let mut sub = Subgraph::default();
    let mut src = source;
    loop {
        let succs = graph.succs(src);
        if succs.len() != 1 {
            break;
        }
        let edge = succs[0];
        if graph.edge(edge).weight() <= CERTAIN {
            break;
        }
        let snk = graph.edge(edge).snk;
        if snk == src || sub.nodes.contains(&snk) {
            // the chain closed on itself; the back edge stays a boundary
            break;
        }
        let snk_preds = graph.preds(snk);
        if snk_preds.len() != 1 || graph.succs(snk).len() != 1 {
            break;
        }
        if graph.edge(snk_preds[0]).weight() <= CERTAIN {
            break;
        }
        // no looping back into the chain
        if graph.succs(snk).iter().any(|e| graph.edge(*e).snk == src) {
            break;
        }
        // both ends must sit strictly inside the flow
        if graph.preds(src).is_empty()
            || graph.succs(snk).is_empty()
            || graph.node(src).is_imaginary()
            || graph.node(snk).is_imaginary()
        {
            break;
        }
        sub.nodes.insert(src);
        sub.nodes.insert(snk);
        sub.edges.insert(edge);
        src = snk;
    }
    sub
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testutil::{chain_graph, weigh};
    use crate::graph::EdgeKind;
    use crate::transforms::virtualize::virtualize_subgraph;

    #[test]
    fn test_merge_chain() {
        // entry -> 0 -> 1 -> 2 -> exit, all certain
        let (mut g, ids) = chain_graph(&[(0, 1, 5), (1, 2, 5), (2, 3, 5)]);
        weigh(&mut g);
        let entry = g.add_imaginary_node();
        g.add_edge(entry, ids[&0], EdgeKind::Imaginary);
        let exit = g.add_imaginary_node();
        g.add_edge(ids[&3], exit, EdgeKind::Imaginary);

        let sub = find(&g, ids[&0]);
        // the chain walks 0 -> 1 -> 2 -> 3
        assert_eq!(sub.nodes.len(), 4);
        assert_eq!(sub.edges.len(), 3);

        let vn = virtualize_subgraph(&mut g, sub);
        assert_eq!(g.node_count(), 3);
        assert!(g.contains_node(vn));
    }

    #[test]
    fn test_no_merge_on_branch() {
        let (mut g, ids) = chain_graph(&[(0, 1, 5), (0, 2, 5)]);
        weigh(&mut g);
        assert!(find(&g, ids[&0]).is_empty());
    }

    #[test]
    fn test_no_merge_into_loop() {
        // 0 -> 1 -> 0: the sink loops straight back to the source
        let (mut g, ids) = chain_graph(&[(0, 1, 5), (1, 0, 5)]);
        weigh(&mut g);
        assert!(find(&g, ids[&0]).is_empty());
    }

    #[test]
    fn test_no_merge_with_shared_sink() {
        // 1 has two predecessors, so 0 cannot swallow it
        let (mut g, ids) = chain_graph(&[(0, 1, 5), (2, 1, 5), (1, 3, 10)]);
        weigh(&mut g);
        assert!(find(&g, ids[&0]).is_empty());
    }
}
