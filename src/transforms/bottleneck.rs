//! General bottleneck search and fan-in/fan-out validation
//!
//! The bottleneck search grows a subgraph outward from a source node by
//! coloring edges. An edge climbs White -> Red/Yellow -> Blue -> Green as
//! the search explains more of its neighborhood; the green set is the
//! candidate subgraph. The search succeeds when the green edges form an
//! acyclic region entered only through the source and left only through a
//! unique sink. Fan-in/fan-out then verifies the region is properly
//! encapsulated and prunes dead-end interiors.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::graph::dijkstra::has_cycle_over;
use crate::graph::{EdgeId, Graph, NodeId};

use super::virtualize::Subgraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Color {
    White,
    Red,
    Yellow,
    Blue,
    Green,
}

/// Grow a bottleneck subgraph from `source`
///
/// Returns the candidate subgraph and its sink on success. Bounded by
/// `max_size` green edges and by the green set refusing to grow.
pub fn find(graph: &Graph, source: NodeId, max_size: usize) -> Option<(Subgraph, NodeId)> {
    if graph.succs(source).is_empty() || graph.node(source).is_imaginary() {
        return None;
    }

    let mut colors: BTreeMap<EdgeId, Color> = BTreeMap::new();
    for e in graph.preds(source) {
        colors.insert(e, Color::Red);
    }
    for e in graph.succs(source) {
        colors.insert(e, Color::Yellow);
    }

    let mut last_green = 0usize;
    loop {
        if last_green >= max_size {
            return None;
        }
        // promote yellow edges whose sink neighborhoods are explained
        let yellows: Vec<EdgeId> = colors
            .iter()
            .filter(|(_, c)| **c == Color::Yellow)
            .map(|(e, _)| *e)
            .collect();
        let at_least_red: BTreeSet<EdgeId> = colors
            .iter()
            .filter(|(_, c)| **c >= Color::Red)
            .map(|(e, _)| *e)
            .collect();
        let at_least_yellow: BTreeSet<EdgeId> = colors
            .iter()
            .filter(|(_, c)| **c >= Color::Yellow)
            .map(|(e, _)| *e)
            .collect();
        for ye in yellows {
            let snk = graph.edge(ye).snk;
            let snk_preds = graph.preds(snk);
            let all_red = snk_preds.iter().all(|p| at_least_red.contains(p));
            let all_yellow = snk_preds.iter().all(|p| at_least_yellow.contains(p));
            if all_red {
                colors.insert(ye, Color::Blue);
            }
            if all_yellow {
                for s in graph.succs(snk) {
                    let c = colors.entry(s).or_insert(Color::White);
                    if *c < Color::Yellow {
                        *c = Color::Yellow;
                    }
                }
            }
            // untouched predecessors of a touched sink become red: their
            // sink matters to the subgraph even though their source is a
            // mystery (a loop back edge, for instance)
            for p in snk_preds {
                if p != ye {
                    colors.entry(p).or_insert(Color::Red);
                }
            }
        }

        // blue edges whose sink neighborhoods are fully at least blue go
        // green; the rest drop back to yellow
        let blues: Vec<EdgeId> = colors
            .iter()
            .filter(|(_, c)| **c == Color::Blue)
            .map(|(e, _)| *e)
            .collect();
        let eligible: BTreeSet<EdgeId> = colors
            .iter()
            .filter(|(_, c)| **c >= Color::Blue)
            .map(|(e, _)| *e)
            .collect();
        for be in blues {
            let snk = graph.edge(be).snk;
            let snk_preds = graph.preds(snk);
            if snk_preds.iter().all(|p| eligible.contains(p)) {
                colors.insert(be, Color::Green);
                let all_yellow = snk_preds
                    .iter()
                    .all(|p| colors.get(p).copied().unwrap_or(Color::White) >= Color::Yellow);
                if all_yellow {
                    for s in graph.succs(snk) {
                        let c = colors.entry(s).or_insert(Color::White);
                        if *c < Color::Yellow {
                            *c = Color::Yellow;
                        }
                    }
                }
            } else {
                colors.insert(be, Color::Yellow);
            }
        }

        let greens: BTreeSet<EdgeId> = colors
            .iter()
            .filter(|(_, c)| **c == Color::Green)
            .map(|(e, _)| *e)
            .collect();
        if let Some((sub, sink)) = green_sink(graph, &greens, &colors, source) {
            // the candidate must be acyclic; a loop back edge is allowed
            // to exist outside the green set
            if has_cycle_over(graph, &sub.edges) {
                return None;
            }
            return Some((sub, sink));
        }
        if greens.len() <= last_green {
            // no progress: the search hit an impasse
            return None;
        }
        last_green = greens.len();
    }
}

/// Check the green set for a unique entrance and a unique exit
fn green_sink(
    graph: &Graph,
    greens: &BTreeSet<EdgeId>,
    colors: &BTreeMap<EdgeId, Color>,
    source: NodeId,
) -> Option<(Subgraph, NodeId)> {
    // small fans are the select transform's job
    if greens.len() < 3 {
        return None;
    }
    let mut nodes = BTreeSet::new();
    for e in greens {
        nodes.insert(graph.edge(*e).src);
        nodes.insert(graph.edge(*e).snk);
    }

    let mut entrances = BTreeSet::new();
    let mut exits = BTreeSet::new();
    for n in &nodes {
        for p in graph.preds(*n) {
            let color = colors.get(&p).copied()?;
            if color == Color::Red {
                if *n == source {
                    entrances.insert(*n);
                } else {
                    // only the source may be entered from outside
                    return None;
                }
            }
        }
        for s in graph.succs(*n) {
            if !greens.contains(&s) {
                exits.insert(*n);
            }
        }
        if graph.preds(*n).is_empty() || graph.succs(*n).is_empty() {
            return None;
        }
    }
    if entrances.len() != 1 || exits.len() != 1 {
        return None;
    }
    let sink = *exits.iter().next().unwrap();
    Some((
        Subgraph {
            nodes,
            edges: greens.clone(),
        },
        sink,
    ))
}

/// Validate and prune a bottleneck candidate
///
/// The subgraph must have at least three nodes, every node at least one
/// predecessor and successor, the source's successors and the sink's
/// predecessors inside, and every interior node fully enclosed. Dead-end
/// interior nodes are pruned.
pub fn validate(graph: &Graph, sub: &mut Subgraph, source: NodeId, sink: NodeId) -> bool {
    if sub.nodes.len() < 3 {
        return false;
    }
    for n in &sub.nodes {
        if graph.preds(*n).is_empty() || graph.succs(*n).is_empty() {
            return false;
        }
    }

    let mut dead_ends = BTreeSet::new();
    for n in &sub.nodes {
        if *n == source {
            for e in graph.succs(*n) {
                if !sub.nodes.contains(&graph.edge(e).snk) {
                    return false;
                }
            }
        } else if *n == sink {
            for e in graph.preds(*n) {
                if !sub.nodes.contains(&graph.edge(e).src) {
                    return false;
                }
            }
        } else {
            for e in graph.preds(*n) {
                if !sub.nodes.contains(&graph.edge(e).src) {
                    return false;
                }
            }
            let mut has_inside_succ = false;
            for e in graph.succs(*n) {
                if !sub.nodes.contains(&graph.edge(e).snk) {
                    return false;
                }
                has_inside_succ = true;
            }
            if !has_inside_succ {
                dead_ends.insert(*n);
            }
        }
    }
    for n in dead_ends {
        sub.nodes.remove(&n);
        for e in graph.preds(n).into_iter().chain(graph.succs(n)) {
            sub.edges.remove(&e);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testutil::{chain_graph, weigh};
    use crate::graph::EdgeKind;

    /// Two-level diamond: 0 -> {1,2}, 1 -> {3,4}, 2 -> 4, {3,4} -> 5
    fn wide_diamond() -> (Graph, std::collections::BTreeMap<i64, NodeId>) {
        let (mut g, ids) = chain_graph(&[
            (0, 1, 6),
            (0, 2, 4),
            (1, 3, 3),
            (1, 4, 3),
            (2, 4, 4),
            (3, 5, 3),
            (4, 5, 7),
        ]);
        weigh(&mut g);
        let entry = g.add_imaginary_node();
        g.add_edge(entry, ids[&0], EdgeKind::Imaginary);
        let exit = g.add_imaginary_node();
        g.add_edge(ids[&5], exit, EdgeKind::Imaginary);
        (g, ids)
    }

    #[test]
    fn test_find_bottleneck_diamond() {
        let (g, ids) = wide_diamond();
        let (mut sub, sink) = find(&g, ids[&0], 200).expect("diamond should be found");
        assert_eq!(sink, ids[&5]);
        assert_eq!(sub.nodes.len(), 6);

        assert!(validate(&g, &mut sub, ids[&0], sink));
        assert_eq!(sub.nodes.len(), 6, "no dead ends to prune");
    }

    #[test]
    fn test_no_bottleneck_from_imaginary() {
        let (g, _) = wide_diamond();
        let entry = g.entry_node().unwrap();
        assert!(find(&g, entry, 200).is_none());
    }

    #[test]
    fn test_cyclic_candidate_rejected() {
        // same diamond plus a back edge inside, making the region cyclic
        let (mut g, ids) = chain_graph(&[
            (0, 1, 6),
            (0, 2, 4),
            (1, 3, 3),
            (1, 4, 3),
            (2, 4, 4),
            (3, 1, 3),
            (4, 5, 7),
        ]);
        weigh(&mut g);
        let entry = g.add_imaginary_node();
        g.add_edge(entry, ids[&0], EdgeKind::Imaginary);
        let exit = g.add_imaginary_node();
        g.add_edge(ids[&5], exit, EdgeKind::Imaginary);
        assert!(find(&g, ids[&0], 200).is_none());
    }

    #[test]
    fn test_validate_rejects_leaky_interior() {
        let (g, ids) = wide_diamond();
        // hand the validator a region that omits node 3, so node 1 leaks
        let mut sub = Subgraph {
            nodes: [ids[&0], ids[&1], ids[&2], ids[&4], ids[&5]]
                .into_iter()
                .collect(),
            edges: BTreeSet::new(),
        };
        assert!(!validate(&g, &mut sub, ids[&0], ids[&5]));
    }
}
