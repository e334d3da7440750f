//! Branch-to-select
//!
//! Collapses one-deep conditional fans: a source whose successors all
//! meet again at a single exit, with at most one layer of middle nodes
//! between them. Case 1 lets the source reach the exit directly; case 2
//! requires every path to pass through a middle node.

use std::collections::BTreeSet;

use crate::graph::{Graph, NodeId};

use super::virtualize::Subgraph;

/// Find a collapsible fan rooted at `source`
///
/// Returns an empty subgraph when the shape does not hold.
pub fn find(graph: &Graph, source: NodeId) -> Subgraph {
    let empty = Subgraph::default();
    if graph.preds(source).is_empty() || graph.succs(source).is_empty() {
        return empty;
    }
    if graph.node(source).is_imaginary() {
        return empty;
    }

    // candidate middle nodes are the source's successors
    let mut mids: BTreeSet<NodeId> = graph
        .succs(source)
        .iter()
        .map(|e| graph.edge(*e).snk)
        .collect();
    if mids.contains(&source) {
        // self loops are cycle territory, not select territory
        return empty;
    }

    // the exit is the common successor of every middle node
    let mut mid_succs: BTreeSet<NodeId> = BTreeSet::new();
    for m in &mids {
        for e in graph.succs(*m) {
            mid_succs.insert(graph.edge(e).snk);
        }
    }

    let exit;
    let direct_case;
    if mid_succs.len() == 1 {
        let candidate = *mid_succs.iter().next().unwrap();
        if mids.remove(&candidate) {
            // the exit was among the source's successors: direct edge
            exit = candidate;
            direct_case = true;
        } else {
            exit = candidate;
            direct_case = false;
        }
    } else {
        // look for a successor of the source that every other successor
        // leads to
        let mut found = None;
        for e in graph.succs(source) {
            let candidate = graph.edge(e).snk;
            let mut common = true;
            for o in graph.succs(source) {
                let other = graph.edge(o).snk;
                if other == candidate {
                    continue;
                }
                if graph
                    .succs(other)
                    .iter()
                    .any(|s| graph.edge(*s).snk != candidate)
                {
                    common = false;
                    break;
                }
            }
            if common {
                found = Some(candidate);
                break;
            }
        }
        match found {
            Some(c) => {
                mids.remove(&c);
                exit = c;
                direct_case = true;
            }
            None => return empty,
        }
    }

    if exit == source || mids.is_empty() {
        return empty;
    }
    if graph.preds(exit).is_empty() || graph.succs(exit).is_empty() {
        return empty;
    }
    if graph.node(exit).is_imaginary() {
        return empty;
    }

    // the source cannot be entered from inside the fan
    for e in graph.preds(source) {
        let p = graph.edge(e).src;
        if p == exit || mids.contains(&p) {
            return empty;
        }
    }
    // every middle node flows from the source only and into the exit only
    for m in &mids {
        let preds = graph.preds(*m);
        if preds.len() != 1 || graph.edge(preds[0]).src != source {
            return empty;
        }
        let succs = graph.succs(*m);
        if succs.len() != 1 || graph.edge(succs[0]).snk != exit {
            return empty;
        }
    }
    // the exit cannot lead back into the fan
    for e in graph.succs(exit) {
        let s = graph.edge(e).snk;
        if s == source || mids.contains(&s) {
            return empty;
        }
    }

    if direct_case {
        // source successors are exactly mids plus the exit; exit
        // predecessors are exactly mids plus the source
        let src_succs: BTreeSet<NodeId> = graph
            .succs(source)
            .iter()
            .map(|e| graph.edge(*e).snk)
            .collect();
        let mut expected = mids.clone();
        expected.insert(exit);
        if src_succs != expected {
            return empty;
        }
        let exit_preds: BTreeSet<NodeId> = graph
            .preds(exit)
            .iter()
            .map(|e| graph.edge(*e).src)
            .collect();
        let mut expected = mids.clone();
        expected.insert(source);
        if exit_preds != expected {
            return empty;
        }
    } else {
        // source successors are exactly the mids; exit predecessors are
        // exactly the mids
        let src_succs: BTreeSet<NodeId> = graph
            .succs(source)
            .iter()
            .map(|e| graph.edge(*e).snk)
            .collect();
        if src_succs != mids {
            return empty;
        }
        let exit_preds: BTreeSet<NodeId> = graph
            .preds(exit)
            .iter()
            .map(|e| graph.edge(*e).src)
            .collect();
        if exit_preds != mids {
            return empty;
        }
    }

    // assemble: source, mids, exit, and the edges that stay inside
    let mut sub = Subgraph::default();
    sub.nodes.insert(source);
    sub.nodes.insert(exit);
    sub.nodes.extend(mids.iter().copied());
    for n in sub.nodes.clone() {
        for e in graph.succs(n) {
            if sub.nodes.contains(&graph.edge(e).snk) && graph.edge(e).snk != source {
                sub.edges.insert(e);
            }
        }
    }
    sub
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testutil::{chain_graph, weigh};
    use crate::graph::EdgeKind;
    use crate::transforms::virtualize::virtualize_subgraph;

    fn anchor(g: &mut Graph, first: NodeId, last: NodeId) {
        let entry = g.add_imaginary_node();
        g.add_edge(entry, first, EdgeKind::Imaginary);
        let exit = g.add_imaginary_node();
        g.add_edge(last, exit, EdgeKind::Imaginary);
    }

    #[test]
    fn test_two_armed_select() {
        // S=0 -> {1, 2} -> E=3, no direct edge
        let (mut g, ids) = chain_graph(&[(0, 1, 9), (0, 2, 1), (1, 3, 9), (2, 3, 1)]);
        weigh(&mut g);
        anchor(&mut g, ids[&0], ids[&3]);

        let sub = find(&g, ids[&0]);
        assert_eq!(sub.nodes.len(), 4);
        assert_eq!(sub.edges.len(), 4);

        let vn = virtualize_subgraph(&mut g, sub);
        assert!(g.contains_node(vn));
        assert_eq!(g.node_count(), 3);
    }

    #[test]
    fn test_select_with_direct_edge() {
        // S=0 -> {1, E}, 1 -> E: the skip edge is allowed in case 1
        let (mut g, ids) = chain_graph(&[(0, 1, 9), (0, 3, 1), (1, 3, 9)]);
        weigh(&mut g);
        anchor(&mut g, ids[&0], ids[&3]);

        let sub = find(&g, ids[&0]);
        assert_eq!(sub.nodes.len(), 3);
        assert!(sub.nodes.contains(&ids[&3]));
    }

    #[test]
    fn test_reject_mid_with_outside_pred() {
        // node 4 also enters mid 1, so the fan is not closed
        let (mut g, ids) = chain_graph(&[
            (0, 1, 9),
            (0, 2, 1),
            (1, 3, 14),
            (2, 3, 1),
            (4, 1, 5),
        ]);
        weigh(&mut g);
        anchor(&mut g, ids[&0], ids[&3]);
        assert!(find(&g, ids[&0]).is_empty());
    }

    #[test]
    fn test_reject_loop_back_to_source() {
        // exit loops back to source
        let (mut g, ids) = chain_graph(&[(0, 1, 5), (0, 2, 5), (1, 3, 5), (2, 3, 5), (3, 0, 10)]);
        weigh(&mut g);
        assert!(find(&g, ids[&0]).is_empty());
    }
}
