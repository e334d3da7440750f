//! Task-cycle segmentation
//!
//! After the rewrite fixpoint, what remains recurrent in the graph is
//! structure worth naming. The segmenter repeatedly finds the most
//! likely cycle through every node, validates candidates, prioritizes
//! overlapping ones by entrance/exit count and recurrence probability,
//! virtualizes the winners as task nodes, and re-runs the rewrites in
//! segmentation mode. A final sanity pass revokes parent tasks that are
//! grouping artifacts rather than kernels.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::config::AnalyzerConfig;
use crate::graph::dijkstra::{find_cycle, has_cycle, has_cycle_among};
use crate::graph::{EdgeId, Graph, NodeId, TaskId};
use crate::transforms::{apply_cfg_transforms, revoke_cycle, virtualize_cycle, Subgraph};

/// The discovered task set
#[derive(Debug, Default)]
pub struct Segmentation {
    /// Task nodes in discovery order
    pub kernels: Vec<NodeId>,
    /// Task ID to graph node
    pub by_kid: BTreeMap<TaskId, NodeId>,
}

#[derive(Debug, Clone)]
struct Candidate {
    nodes: BTreeSet<NodeId>,
    edges: BTreeSet<EdgeId>,
    entrances: usize,
    exits: usize,
    path_probability: f32,
    anchor: u64,
}

impl Candidate {
    fn enex_score(&self) -> usize {
        self.entrances + self.exits
    }

    fn overlaps(&self, other: &Candidate) -> bool {
        self.nodes.intersection(&other.nodes).next().is_some()
    }
}

fn interior_edges(graph: &Graph, nodes: &BTreeSet<NodeId>) -> BTreeSet<EdgeId> {
    let mut edges = BTreeSet::new();
    for n in nodes {
        for e in graph.succs(*n) {
            if nodes.contains(&graph.edge(e).snk) {
                edges.insert(e);
            }
        }
    }
    edges
}

fn boundary_counts(graph: &Graph, nodes: &BTreeSet<NodeId>) -> (usize, usize) {
    let mut entrances = 0;
    let mut exits = 0;
    for n in nodes {
        for e in graph.preds(*n) {
            if !nodes.contains(&graph.edge(e).src) {
                entrances += 1;
            }
        }
        for e in graph.succs(*n) {
            if !nodes.contains(&graph.edge(e).snk) {
                exits += 1;
            }
        }
    }
    (entrances, exits)
}

/// Build and validate a candidate cycle found through `pivot`
fn build_candidate(
    graph: &Graph,
    pivot: NodeId,
    nodes: BTreeSet<NodeId>,
    config: &AnalyzerConfig,
) -> Option<Candidate> {
    // the cycle must be the only cycle in its own subgraph: removing the
    // pivot has to break all recurrence, and a pivot self loop on a
    // multi-node cycle means a second one
    let mut rest = nodes.clone();
    rest.remove(&pivot);
    if has_cycle_among(graph, &rest) {
        return None;
    }
    if !rest.is_empty() && graph.find_edge_between(pivot, pivot).is_some() {
        return None;
    }

    let anchor = graph.anchor_of(&nodes);
    if anchor < config.min_anchor {
        return None;
    }
    let (entrances, exits) = boundary_counts(graph, &nodes);
    if entrances == 0 || exits == 0 {
        return None;
    }

    let edges = interior_edges(graph, &nodes);
    let path_probability = edges
        .iter()
        .map(|e| graph.edge(*e).weight())
        .product::<f32>();

    Some(Candidate {
        nodes,
        edges,
        entrances,
        exits,
        path_probability,
        anchor,
    })
}

/// Throw out overlapping candidates in structuring order
///
/// Loops with the fewest entrances and exits, then with the highest
/// recurrence probability, structure first: that builds hierarchies from
/// child-most to parent-most. When every candidate defeats every other,
/// the minimum-probability one wins so progress never stalls.
fn prioritize(candidates: Vec<Candidate>) -> Vec<Candidate> {
    if candidates.is_empty() {
        return candidates;
    }
    let min_score = candidates.iter().map(|c| c.enex_score()).min().unwrap();
    let mut removed = vec![false; candidates.len()];

    for i in 0..candidates.len() {
        if removed[i] {
            continue;
        }
        if candidates[i].enex_score() > min_score {
            removed[i] = true;
            continue;
        }
        for j in 0..candidates.len() {
            if i == j || removed[j] {
                continue;
            }
            if !candidates[i].overlaps(&candidates[j]) {
                continue;
            }
            let pi = candidates[i].path_probability;
            let pj = candidates[j].path_probability;
            if pi > pj || (pi - pj).abs() < 0.001 {
                removed[j] = true;
            } else {
                removed[i] = true;
                break;
            }
        }
    }

    if removed.iter().all(|r| *r) {
        // pathological tie: keep the single least-probable loop
        let winner = candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.path_probability
                    .partial_cmp(&b.path_probability)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
            .unwrap();
        return vec![candidates[winner].clone()];
    }

    candidates
        .into_iter()
        .zip(removed)
        .filter(|(_, r)| !*r)
        .map(|(c, _)| c)
        .collect()
}

/// Virtualize one accepted cycle and wire up the task hierarchy
fn install_task(graph: &mut Graph, candidate: Candidate, seg: &mut Segmentation) -> NodeId {
    let vn = virtualize_cycle(
        graph,
        Subgraph {
            nodes: candidate.nodes.clone(),
            edges: candidate.edges,
        },
    );
    graph.renormalize_succs(vn);

    // tasks already buried in the subgraph become children; the search
    // descends through plain virtual layers but never crosses another
    // task's boundary
    let mut children: Vec<NodeId> = Vec::new();
    let mut queue: Vec<NodeId> = candidate.nodes.iter().copied().collect();
    while let Some(n) = queue.pop() {
        let node = graph.node(n);
        if node.is_cycle() {
            children.push(n);
            continue;
        }
        if let Some(v) = node.virtual_data() {
            queue.extend(v.subgraph.iter().copied());
        }
    }

    let kid = graph.node(vn).as_cycle().expect("task node").kid;
    let mut child_blocks = BTreeSet::new();
    for c in &children {
        let child = graph.node_mut(*c).as_cycle_mut().expect("child task");
        child.parents.insert(kid);
        let child_kid = child.kid;
        child_blocks.extend(child.virt.blocks.iter().copied());
        graph
            .node_mut(vn)
            .as_cycle_mut()
            .expect("task node")
            .children
            .insert(child_kid);
    }
    // a task's blocks are the ones exclusive to it
    let cycle = graph.node_mut(vn).as_cycle_mut().expect("task node");
    cycle.virt.blocks = cycle
        .virt
        .blocks
        .difference(&child_blocks)
        .copied()
        .collect();

    seg.kernels.push(vn);
    seg.by_kid.insert(kid, vn);
    vn
}

/// Find every task cycle in the transformed graph
pub fn find_tasks(graph: &mut Graph, config: &AnalyzerConfig) -> Segmentation {
    let mut seg = Segmentation::default();

    loop {
        let mut candidates: Vec<Candidate> = Vec::new();
        for n in graph.node_ids() {
            if graph.node(n).is_imaginary() {
                continue;
            }
            let nodes = find_cycle(graph, n);
            if nodes.is_empty() {
                continue;
            }
            if candidates.iter().any(|c| c.nodes == nodes) {
                continue;
            }
            if let Some(c) = build_candidate(graph, n, nodes, config) {
                candidates.push(c);
            }
        }

        let accepted = prioritize(candidates);
        if accepted.is_empty() {
            break;
        }

        let mut installed = 0;
        for candidate in accepted {
            // a sibling installed earlier this round may have swallowed
            // part of this one
            if !candidate.nodes.iter().all(|n| graph.contains_node(*n)) {
                continue;
            }
            let vn = install_task(graph, candidate, &mut seg);
            debug!(task = vn.0, "virtualized task cycle");
            installed += 1;
        }
        if installed == 0 {
            break;
        }

        // collapsing cycles exposes new rewrite opportunities
        if has_cycle(graph) {
            apply_cfg_transforms(graph, config, true);
        }
    }

    revoke_artificial_hierarchies(graph, config, &mut seg);
    info!(tasks = seg.kernels.len(), "segmentation complete");
    seg
}

/// Revoke outer tasks that only group other hierarchies
///
/// A while loop feeding a pipeline of real kernels piece-meal looks like
/// a task wrapping them all. An outer-most task whose two or more
/// children are all themselves hierarchies is expanded back into its
/// parts, unless it has enough children to be a kernel nursery in its
/// own right.
fn revoke_artificial_hierarchies(
    graph: &mut Graph,
    config: &AnalyzerConfig,
    seg: &mut Segmentation,
) {
    loop {
        let mut to_revoke: Vec<NodeId> = Vec::new();
        for vn in &seg.kernels {
            let cycle = match graph.node(*vn).as_cycle() {
                Some(c) => c,
                None => continue,
            };
            if !cycle.parents.is_empty() {
                continue;
            }
            if cycle.children.len() < 2 {
                continue;
            }
            if cycle.children.len() >= config.min_child_kernel_exception {
                continue;
            }
            let all_hierarchies = cycle.children.iter().all(|kid| {
                seg.by_kid
                    .get(kid)
                    .map(|n| {
                        graph
                            .node(*n)
                            .as_cycle()
                            .map(|c| !c.children.is_empty())
                            .unwrap_or(false)
                    })
                    .unwrap_or(false)
            });
            if all_hierarchies {
                to_revoke.push(*vn);
            }
        }
        if to_revoke.is_empty() {
            break;
        }
        for vn in to_revoke {
            let (kid, children) = {
                let c = graph.node(vn).as_cycle().expect("task node");
                (c.kid, c.children.clone())
            };
            debug!(task = vn.0, "revoking artificial hierarchy");
            revoke_cycle(graph, vn);
            for child_kid in children {
                if let Some(child) = seg.by_kid.get(&child_kid).copied() {
                    if let Some(c) = graph.node_mut(child).as_cycle_mut() {
                        c.parents.remove(&kid);
                    }
                }
            }
            seg.kernels.retain(|k| *k != vn);
            seg.by_kid.remove(&kid);
        }
    }
}
