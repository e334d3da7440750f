//! Cycle search over the weighted graph
//!
//! The segmenter looks for the most likely way an execution returns to a
//! node. Mapping each branch probability w to a length of -ln(w) turns
//! "most probable cycle" into "shortest cycle", which a single-source
//! shortest-path run from a node back to itself can answer.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use super::{EdgeId, Graph, NodeId};

/// Heap entry ordered by ascending distance, ties broken by node ID
struct QueueEntry {
    dist: f64,
    node: NodeId,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed so the max-heap pops the smallest distance first
        other
            .dist
            .partial_cmp(&self.dist)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.node.cmp(&self.node))
    }
}

fn edge_length(graph: &Graph, e: EdgeId) -> f64 {
    let w = graph.edge(e).weight() as f64;
    if w <= 0.0 {
        f64::INFINITY
    } else {
        -w.ln()
    }
}

/// Find the maximum-likelihood cycle through `source` on the visible graph
///
/// Returns the set of nodes on the cycle (including `source`), or an empty
/// set when no path leads back to the source.
pub fn find_cycle(graph: &Graph, source: NodeId) -> BTreeSet<NodeId> {
    let mut dist: BTreeMap<NodeId, f64> = BTreeMap::new();
    let mut pred: BTreeMap<NodeId, NodeId> = BTreeMap::new();
    let mut done: BTreeSet<NodeId> = BTreeSet::new();
    // the source's re-entry is tracked separately so its zero starting
    // distance does not suppress the returning edge
    let mut source_pred: Option<NodeId> = None;

    dist.insert(source, 0.0);
    let mut heap = BinaryHeap::new();
    heap.push(QueueEntry {
        dist: 0.0,
        node: source,
    });

    while let Some(QueueEntry { dist: d, node: u }) = heap.pop() {
        if done.contains(&u) {
            continue;
        }
        done.insert(u);
        for e in graph.succs(u) {
            let snk = graph.edge(e).snk;
            let len = edge_length(graph, e);
            if len.is_infinite() {
                continue;
            }
            if snk == source && source_pred.is_none() {
                source_pred = Some(u);
            }
            let nd = d + len;
            if nd < *dist.get(&snk).unwrap_or(&f64::INFINITY) {
                dist.insert(snk, nd);
                pred.insert(snk, u);
                if !done.contains(&snk) {
                    heap.push(QueueEntry { dist: nd, node: snk });
                }
            }
        }
    }

    let mut cycle = BTreeSet::new();
    let mut prev = match source_pred {
        Some(p) => p,
        None => return cycle,
    };
    cycle.insert(prev);
    while prev != source {
        prev = match pred.get(&prev) {
            Some(p) => *p,
            // the returning edge was found but no path reaches its source
            None => return BTreeSet::new(),
        };
        cycle.insert(prev);
    }
    cycle
}

/// True if the visible subgraph induced by `nodes` contains a cycle
///
/// Edges are followed only when both endpoints lie in `nodes`. Imaginary
/// edges never close a cycle because imaginary nodes have one-sided
/// adjacency.
pub fn has_cycle_among(graph: &Graph, nodes: &BTreeSet<NodeId>) -> bool {
    let mut visited: BTreeSet<NodeId> = BTreeSet::new();
    // iterative DFS with an explicit on-stack set for back-edge detection
    for start in nodes {
        if visited.contains(start) {
            continue;
        }
        let mut stack: Vec<(NodeId, Vec<NodeId>)> = Vec::new();
        let mut on_stack: BTreeSet<NodeId> = BTreeSet::new();
        let succs_of = |g: &Graph, n: NodeId| -> Vec<NodeId> {
            g.succs(n)
                .into_iter()
                .map(|e| g.edge(e).snk)
                .filter(|s| nodes.contains(s))
                .collect()
        };
        stack.push((*start, succs_of(graph, *start)));
        on_stack.insert(*start);
        visited.insert(*start);
        loop {
            let next = match stack.last_mut() {
                Some((_, pending)) => pending.pop(),
                None => break,
            };
            match next {
                Some(next) => {
                    if on_stack.contains(&next) {
                        return true;
                    }
                    if visited.insert(next) {
                        on_stack.insert(next);
                        let succs = succs_of(graph, next);
                        stack.push((next, succs));
                    }
                }
                None => {
                    let (n, _) = stack.pop().expect("stack entry present");
                    on_stack.remove(&n);
                }
            }
        }
    }
    false
}

/// True if the whole visible graph contains a cycle
pub fn has_cycle(graph: &Graph) -> bool {
    let nodes: BTreeSet<NodeId> = graph.node_ids().into_iter().collect();
    has_cycle_among(graph, &nodes)
}

/// True if the subgraph formed by exactly these edges contains a cycle
///
/// Unlike [`has_cycle_among`], other edges between the same nodes do not
/// count; the bottleneck search uses this on its green set, where the
/// loop-closing back edge is intentionally excluded.
pub fn has_cycle_over(graph: &Graph, edges: &BTreeSet<EdgeId>) -> bool {
    let mut nodes: BTreeSet<NodeId> = BTreeSet::new();
    for e in edges {
        nodes.insert(graph.edge(*e).src);
        nodes.insert(graph.edge(*e).snk);
    }
    let succs_of = |n: NodeId| -> Vec<NodeId> {
        graph
            .node(n)
            .succs
            .iter()
            .filter(|e| edges.contains(e))
            .map(|e| graph.edge(*e).snk)
            .collect()
    };

    let mut visited: BTreeSet<NodeId> = BTreeSet::new();
    for start in &nodes {
        if visited.contains(start) {
            continue;
        }
        let mut stack: Vec<(NodeId, Vec<NodeId>)> = vec![(*start, succs_of(*start))];
        let mut on_stack: BTreeSet<NodeId> = [*start].into_iter().collect();
        visited.insert(*start);
        loop {
            let next = match stack.last_mut() {
                Some((_, pending)) => pending.pop(),
                None => break,
            };
            match next {
                Some(next) => {
                    if on_stack.contains(&next) {
                        return true;
                    }
                    if visited.insert(next) {
                        on_stack.insert(next);
                        let succs = succs_of(next);
                        stack.push((next, succs));
                    }
                }
                None => {
                    let (n, _) = stack.pop().expect("stack entry present");
                    on_stack.remove(&n);
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testutil::{chain_graph, weigh};

    #[test]
    fn test_find_cycle_simple_loop() {
        // 0 -> 1 -> 2 -> 0
        let (mut g, ids) = chain_graph(&[(0, 1, 5), (1, 2, 5), (2, 0, 5)]);
        weigh(&mut g);
        let cycle = find_cycle(&g, ids[&0]);
        assert_eq!(cycle.len(), 3);
        assert!(cycle.contains(&ids[&0]));
        assert!(cycle.contains(&ids[&1]));
        assert!(cycle.contains(&ids[&2]));
    }

    #[test]
    fn test_find_cycle_none_in_dag() {
        let (mut g, ids) = chain_graph(&[(0, 1, 1), (1, 2, 1)]);
        weigh(&mut g);
        assert!(find_cycle(&g, ids[&0]).is_empty());
        assert!(find_cycle(&g, ids[&2]).is_empty());
    }

    #[test]
    fn test_find_cycle_prefers_likely_path() {
        // two ways back to 0: a hot inner loop through 1 and a cold
        // detour through 2 and 3
        let (mut g, ids) = chain_graph(&[
            (0, 1, 90),
            (1, 0, 90),
            (0, 2, 10),
            (2, 3, 10),
            (3, 0, 10),
        ]);
        weigh(&mut g);
        let cycle = find_cycle(&g, ids[&0]);
        assert!(cycle.contains(&ids[&1]), "hot loop should win");
        assert!(!cycle.contains(&ids[&2]));
    }

    #[test]
    fn test_has_cycle_among_subsets() {
        let (g, ids) = chain_graph(&[(0, 1, 1), (1, 2, 1), (2, 0, 1), (2, 3, 1)]);
        let all: BTreeSet<NodeId> = [ids[&0], ids[&1], ids[&2]].into_iter().collect();
        assert!(has_cycle_among(&g, &all));
        // removing node 1 breaks the only cycle
        let partial: BTreeSet<NodeId> = [ids[&0], ids[&2], ids[&3]].into_iter().collect();
        assert!(!has_cycle_among(&g, &partial));
    }

    #[test]
    fn test_self_loop_detected() {
        let (g, ids) = chain_graph(&[(0, 0, 4), (0, 1, 1)]);
        let lone: BTreeSet<NodeId> = [ids[&0]].into_iter().collect();
        assert!(has_cycle_among(&g, &lone));
    }
}
