//! Subgraph virtualization and its inverse
//!
//! Every rewrite ends the same way: a candidate subgraph is wrapped in a
//! single virtual node, its boundary edges become virtual edges covering
//! the originals, and the interior leaves the visible graph while staying
//! alive in the arena. The reverse transform peels those layers back off,
//! either completely or just far enough to expose the parent-most task
//! cycles.

use std::collections::BTreeSet;

use tracing::debug;

use crate::graph::{EdgeId, EdgeKind, Graph, NodeId, VirtualData};

/// A candidate subgraph: interior nodes plus interior edges
#[derive(Debug, Clone, Default)]
pub struct Subgraph {
    pub nodes: BTreeSet<NodeId>,
    pub edges: BTreeSet<EdgeId>,
}

impl Subgraph {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Wrap a subgraph in a fresh virtual node
pub fn virtualize_subgraph(graph: &mut Graph, sub: Subgraph) -> NodeId {
    virtualize_impl(graph, sub, false)
}

/// Wrap a subgraph in a fresh task-cycle node
pub fn virtualize_cycle(graph: &mut Graph, sub: Subgraph) -> NodeId {
    virtualize_impl(graph, sub, true)
}

fn virtualize_impl(graph: &mut Graph, sub: Subgraph, cycle: bool) -> NodeId {
    debug_assert!(!sub.is_empty(), "refusing to virtualize an empty subgraph");

    let mut blocks = BTreeSet::new();
    for n in &sub.nodes {
        blocks.extend(graph.node(*n).blocks());
    }
    let anchor = graph.anchor_of(&sub.nodes);
    let data = VirtualData {
        subgraph: sub.nodes.clone(),
        sub_edges: sub.edges.clone(),
        blocks,
        anchor,
    };
    let vn = if cycle {
        graph.add_cycle_node(data)
    } else {
        graph.add_virtual_node(data)
    };

    // classify the boundary before mutating anything
    let mut imaginary_in = Vec::new();
    let mut entrance_srcs = BTreeSet::new();
    for n in &sub.nodes {
        for e in graph.preds(*n) {
            if sub.edges.contains(&e) {
                continue;
            }
            let edge = graph.edge(e);
            if edge.is_imaginary() {
                imaginary_in.push(e);
            } else if !sub.nodes.contains(&edge.src) {
                entrance_srcs.insert(edge.src);
            }
            // circling edges (src inside, not interior) wait for the exit pass
        }
    }
    let mut imaginary_out = Vec::new();
    let mut exits = Vec::new();
    for n in &sub.nodes {
        for e in graph.succs(*n) {
            if sub.edges.contains(&e) {
                continue;
            }
            if graph.edge(e).is_imaginary() {
                imaginary_out.push(e);
            } else {
                exits.push(e);
            }
        }
    }
    exits.sort();
    exits.dedup();

    // imaginary edges are retargeted, never wrapped; the interior node
    // keeps the edge in its adjacency so unwinding can re-anchor it
    for e in imaginary_in {
        graph.retarget_snk(e, vn);
    }
    for e in imaginary_out {
        graph.retarget_src(e, vn);
    }

    // one virtual edge per outside entrance node, covering every edge it
    // sends into the subgraph
    for ent in entrance_srcs {
        let total = graph.outgoing_freq(ent);
        let covered: Vec<EdgeId> = graph
            .succs(ent)
            .into_iter()
            .filter(|e| sub.nodes.contains(&graph.edge(*e).snk) && !graph.edge(*e).is_imaginary())
            .collect();
        let vn_freq: u64 = covered.iter().map(|e| graph.edge(*e).freq()).sum();
        for e in &covered {
            graph.hide_edge(*e);
            graph.remove_successor(ent, *e);
        }
        let ve = graph.add_edge(
            ent,
            vn,
            EdgeKind::Virtual {
                freq: vn_freq,
                weight: 0.0,
                underlying: covered.into_iter().collect(),
            },
        );
        graph.edge_mut(ve).set_weight_from_total(total);
    }

    // one virtual edge per exit edge; an exit whose sink is interior is a
    // circling edge and becomes a self loop on the virtual node
    for e in exits {
        let (snk, freq, weight) = {
            let edge = graph.edge(e);
            (edge.snk, edge.freq(), edge.weight())
        };
        let circles = sub.nodes.contains(&snk);
        graph.hide_edge(e);
        if !circles {
            graph.remove_predecessor(snk, e);
        }
        let target = if circles { vn } else { snk };
        let ve = graph.add_edge(
            vn,
            target,
            EdgeKind::Virtual {
                freq,
                weight: 0.0,
                underlying: [e].into_iter().collect(),
            },
        );
        graph.edge_mut(ve).set_weight(weight);
    }

    for n in &sub.nodes {
        graph.hide_node(*n);
    }
    for e in &sub.edges {
        graph.hide_edge(*e);
    }
    debug!(vn = vn.0, interior = sub.nodes.len(), cycle, "virtualized subgraph");
    vn
}

// ----------------------------------------------------------------------
// Unwinding
// ----------------------------------------------------------------------

/// A virtual node can unwind only when none of its boundary virtual edges
/// cover an edge that points at the node itself. Such an edge belongs to a
/// later transform of a neighbor and must be restored by unwinding that
/// neighbor first, or the re-exposed edge would dangle at a dead node.
pub fn can_unwind(graph: &Graph, vn: NodeId) -> bool {
    for p in graph.preds(vn) {
        if let Some(underlying) = graph.edge(p).underlying() {
            if underlying.iter().any(|u| graph.edge(*u).snk == vn) {
                return false;
            }
        }
    }
    for s in graph.succs(vn) {
        if let Some(underlying) = graph.edge(s).underlying() {
            if underlying.iter().any(|u| graph.edge(*u).src == vn) {
                return false;
            }
        }
    }
    true
}

/// Expand a virtual node back into its interior
///
/// Boundary virtual edges are detached and their underlying edges
/// re-admitted and re-wired; retargeted imaginary edges are re-anchored
/// to the interior node that still holds them in its adjacency.
pub fn unwind(graph: &mut Graph, vn: NodeId) {
    debug_assert!(can_unwind(graph, vn));
    let data = graph
        .node(vn)
        .virtual_data()
        .expect("unwind target must be virtual")
        .clone();

    for n in &data.subgraph {
        graph.show_node(*n);
    }
    for e in &data.sub_edges {
        graph.show_edge(*e);
    }

    for p in graph.preds(vn) {
        if !graph.contains_edge(p) {
            continue;
        }
        if graph.edge(p).is_virtual() {
            let underlying: Vec<EdgeId> =
                graph.edge(p).underlying().unwrap().iter().copied().collect();
            graph.detach_edge(p);
            for u in underlying {
                graph.show_edge(u);
                graph.wire_edge(u);
            }
        } else if graph.edge(p).is_imaginary() {
            let owner = data
                .subgraph
                .iter()
                .copied()
                .find(|n| graph.node(*n).preds.contains(&p));
            if let Some(owner) = owner {
                graph.remove_predecessor(vn, p);
                graph.retarget_snk(p, owner);
            }
        } else {
            debug_assert!(false, "non-virtual boundary edge on a virtual node");
        }
    }
    for s in graph.succs(vn) {
        if !graph.contains_edge(s) {
            continue;
        }
        if graph.edge(s).is_virtual() {
            let underlying: Vec<EdgeId> =
                graph.edge(s).underlying().unwrap().iter().copied().collect();
            graph.detach_edge(s);
            for u in underlying {
                graph.show_edge(u);
                graph.wire_edge(u);
            }
        } else if graph.edge(s).is_imaginary() {
            let owner = data
                .subgraph
                .iter()
                .copied()
                .find(|n| graph.node(*n).succs.contains(&s));
            if let Some(owner) = owner {
                graph.remove_successor(vn, s);
                graph.retarget_src(s, owner);
            }
        } else {
            debug_assert!(false, "non-virtual boundary edge on a virtual node");
        }
    }

    graph.hide_node(vn);
    debug!(vn = vn.0, "unwound virtual node");
}

/// Unwind `target`, first unwinding any neighbor whose later transform
/// blocks it
pub fn unwind_with_blockers(graph: &mut Graph, target: NodeId) {
    let mut chain = vec![target];
    while let Some(&current) = chain.last() {
        if can_unwind(graph, current) {
            unwind(graph, current);
            chain.pop();
            continue;
        }
        let blocker = find_blocker(graph, current);
        match blocker {
            Some(b) if !chain.contains(&b) => chain.push(b),
            // a blocking cycle cannot happen for well-formed layering;
            // bail rather than loop
            _ => {
                debug_assert!(false, "virtualization layering is inconsistent");
                break;
            }
        }
    }
}

/// The visible neighbor whose unwinding would unblock `vn`
fn find_blocker(graph: &Graph, vn: NodeId) -> Option<NodeId> {
    for p in graph.preds(vn) {
        if let Some(underlying) = graph.edge(p).underlying() {
            if underlying.iter().any(|u| graph.edge(*u).snk == vn) {
                return Some(graph.edge(p).src);
            }
        }
    }
    for s in graph.succs(vn) {
        if let Some(underlying) = graph.edge(s).underlying() {
            if underlying.iter().any(|u| graph.edge(*u).src == vn) {
                return Some(graph.edge(s).snk);
            }
        }
    }
    None
}

/// Fully expand the graph: no virtual node survives
///
/// The result is isomorphic to the post-classification graph; every
/// transform's boundary rewiring is undone in reverse layering order.
pub fn reverse_full(graph: &mut Graph) {
    loop {
        let virtuals: Vec<NodeId> = graph
            .node_ids()
            .into_iter()
            .filter(|n| graph.node(*n).is_virtual())
            .collect();
        if virtuals.is_empty() {
            break;
        }
        let mut progressed = false;
        for vn in virtuals {
            if graph.contains_node(vn) && can_unwind(graph, vn) {
                unwind(graph, vn);
                progressed = true;
            }
        }
        if !progressed {
            // should be impossible; avoid spinning on a malformed graph
            debug_assert!(false, "no unwindable virtual node left");
            break;
        }
    }

    // flow balancing leaves virtual edges between plain nodes; expand
    // them too so the original frequencies come back
    loop {
        let floating: Vec<EdgeId> = graph
            .edge_ids()
            .into_iter()
            .filter(|e| graph.edge(*e).is_virtual())
            .collect();
        if floating.is_empty() {
            break;
        }
        for e in floating {
            if !graph.contains_edge(e) {
                continue;
            }
            let underlying: Vec<EdgeId> =
                graph.edge(e).underlying().unwrap().iter().copied().collect();
            graph.detach_edge(e);
            for u in underlying {
                graph.show_edge(u);
                graph.wire_edge(u);
            }
        }
    }
}

/// Expand only until every parent-most task cycle is visible
///
/// Plain virtual nodes with a task somewhere beneath them are peeled
/// away; task nodes themselves are left intact, as are virtual nodes
/// covering no task.
pub fn reverse_to_tasks(graph: &mut Graph) {
    loop {
        let candidate = graph
            .node_ids()
            .into_iter()
            .find(|n| {
                let node = graph.node(*n);
                node.is_virtual() && !node.is_cycle() && graph.covers_cycle(*n)
            });
        match candidate {
            Some(vn) => unwind_with_blockers(graph, vn),
            None => break,
        }
    }
}

/// Expand one task cycle back into its interior, wherever it sits
///
/// Used by the hierarchy-sanity pass to revoke a task that turned out to
/// be a grouping artifact rather than a kernel.
pub fn revoke_cycle(graph: &mut Graph, task: NodeId) {
    while !graph.contains_node(task) {
        let cover = graph
            .node_ids()
            .into_iter()
            .find(|n| graph.covers_node(*n, task));
        match cover {
            Some(c) => unwind_with_blockers(graph, c),
            None => return,
        }
    }
    unwind_with_blockers(graph, task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testutil::{chain_graph, weigh};

    /// Diamond 0 -> {1,2} -> 3 with an imaginary entry on 0
    fn diamond() -> (Graph, std::collections::BTreeMap<i64, NodeId>) {
        let (mut g, ids) = chain_graph(&[(0, 1, 6), (0, 2, 4), (1, 3, 6), (2, 3, 4)]);
        weigh(&mut g);
        let entry = g.add_imaginary_node();
        g.add_edge(entry, ids[&0], EdgeKind::Imaginary);
        let exit = g.add_imaginary_node();
        g.add_edge(ids[&3], exit, EdgeKind::Imaginary);
        (g, ids)
    }

    fn snapshot(g: &Graph) -> (Vec<NodeId>, Vec<(EdgeId, NodeId, NodeId, u64)>) {
        let nodes = g.node_ids();
        let edges = g
            .edge_ids()
            .into_iter()
            .map(|e| {
                let edge = g.edge(e);
                (e, edge.src, edge.snk, edge.freq())
            })
            .collect();
        (nodes, edges)
    }

    #[test]
    fn test_virtualize_diamond_interior() {
        let (mut g, ids) = diamond();
        let before = snapshot(&g);

        let sub = Subgraph {
            nodes: [ids[&1], ids[&2]].into_iter().collect(),
            edges: BTreeSet::new(),
        };
        let vn = virtualize_subgraph(&mut g, sub);

        // 0 -> vn -> 3, interiors hidden
        assert!(!g.contains_node(ids[&1]));
        assert!(!g.contains_node(ids[&2]));
        let ent = g.find_edge_between(ids[&0], vn).expect("entrance edge");
        assert_eq!(g.edge(ent).freq(), 10);
        assert!((g.edge(ent).weight() - 1.0).abs() < 1e-3);
        // two exits collapse into two virtual edges vn -> 3
        let exits = g.succs(vn);
        assert_eq!(exits.len(), 2);
        let exit_freq: u64 = exits.iter().map(|e| g.edge(*e).freq()).sum();
        assert_eq!(exit_freq, 10);

        reverse_full(&mut g);
        assert_eq!(snapshot(&g), before, "round trip must restore the graph");
    }

    #[test]
    fn test_virtualize_cycle_self_loop() {
        // 0 -> 1 -> 2 -> 1 ..., collapsing {1, 2} with interior edge
        // 1 -> 2 leaves the back edge 2 -> 1 as a circling self loop
        let (mut g, ids) = chain_graph(&[(0, 1, 1), (1, 2, 10), (2, 1, 9), (2, 3, 1)]);
        weigh(&mut g);
        let before = snapshot(&g);

        let interior = g.find_edge_between(ids[&1], ids[&2]).unwrap();
        let sub = Subgraph {
            nodes: [ids[&1], ids[&2]].into_iter().collect(),
            edges: [interior].into_iter().collect(),
        };
        let vn = virtualize_cycle(&mut g, sub);

        assert!(g.node(vn).is_cycle());
        let self_loop = g.find_edge_between(vn, vn).expect("circling edge");
        assert_eq!(g.edge(self_loop).freq(), 9);
        // anchor is the hottest interior node: node 2 sees 10 incoming
        assert_eq!(g.node(vn).virtual_data().unwrap().anchor, 10);

        reverse_full(&mut g);
        assert_eq!(snapshot(&g), before);
    }

    #[test]
    fn test_layered_virtualization_round_trip() {
        // virtualize {1}, then {0} next to it, then unwind everything;
        // the second transform wraps the first one's boundary edge
        let (mut g, ids) = chain_graph(&[(0, 1, 5), (1, 2, 5)]);
        weigh(&mut g);
        let before = snapshot(&g);

        let first = virtualize_subgraph(
            &mut g,
            Subgraph {
                nodes: [ids[&1]].into_iter().collect(),
                edges: BTreeSet::new(),
            },
        );
        let second = virtualize_subgraph(
            &mut g,
            Subgraph {
                nodes: [ids[&0]].into_iter().collect(),
                edges: BTreeSet::new(),
            },
        );

        // the older node is blocked until the newer one unwinds
        assert!(!can_unwind(&g, first));
        assert!(can_unwind(&g, second));

        reverse_full(&mut g);
        assert_eq!(snapshot(&g), before);
    }

    #[test]
    fn test_imaginary_edges_are_retargeted() {
        let (mut g, ids) = diamond();
        let entry = g.entry_node().unwrap();

        let sub = Subgraph {
            nodes: [ids[&0], ids[&1], ids[&2]].into_iter().collect(),
            edges: g
                .edge_ids()
                .into_iter()
                .filter(|e| {
                    let edge = g.edge(*e);
                    [ids[&0], ids[&1], ids[&2]].contains(&edge.src)
                        && [ids[&1], ids[&2]].contains(&edge.snk)
                })
                .collect(),
        };
        let vn = virtualize_subgraph(&mut g, sub);

        // the imaginary entry edge now points at the virtual node
        let im = g.succs(entry)[0];
        assert_eq!(g.edge(im).snk, vn);
        assert!(g.edge(im).is_imaginary());

        unwind(&mut g, vn);
        let im = g.succs(entry)[0];
        assert_eq!(g.edge(im).snk, ids[&0]);
    }

    #[test]
    fn test_revoke_buried_cycle() {
        // a task cycle hidden beneath a later plain virtual node
        let (mut g, ids) = chain_graph(&[(0, 1, 1), (1, 1, 8), (1, 2, 1)]);
        weigh(&mut g);

        let back = g.find_edge_between(ids[&1], ids[&1]).unwrap();
        let task = virtualize_cycle(
            &mut g,
            Subgraph {
                nodes: [ids[&1]].into_iter().collect(),
                edges: [back].into_iter().collect(),
            },
        );
        let cover = virtualize_subgraph(
            &mut g,
            Subgraph {
                nodes: [task].into_iter().collect(),
                edges: BTreeSet::new(),
            },
        );
        assert!(g.contains_node(cover));
        assert!(!g.contains_node(task));
        assert!(g.covers_cycle(cover));

        revoke_cycle(&mut g, task);
        assert!(g.contains_node(ids[&1]), "task interior re-exposed");
        assert!(!g.contains_node(task));
        assert!(!g.contains_node(cover));
    }
}
