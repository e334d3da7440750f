//! Hot-code and hot-loop detection
//!
//! A cheaper alternative to full structuring, available only for
//! markov-order-1 profiles where nodes and blocks coincide. Blocks are
//! ranked by execution frequency, the hottest taken until the configured
//! share of runtime is covered, and adjacent hot blocks grouped into
//! regions. Hot loops intersect those regions with statically known loop
//! bodies.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::info;

use crate::graph::{Graph, NodeId};
use crate::ir::{BlockId, LoopInfo};

const MIN_HOT_FREQUENCY: u64 = 16;

/// A group of adjacent hot blocks
#[derive(Debug, Clone, Default, Serialize)]
pub struct HotRegion {
    pub blocks: BTreeSet<BlockId>,
    #[serde(skip)]
    pub nodes: BTreeSet<NodeId>,
}

/// Rank blocks by frequency and group the hottest into regions
///
/// Blocks are taken in descending frequency order, skipping anything at
/// or below the minimum, until `hot_threshold` of the total frequency is
/// accounted for. Regions are the connected groups the hot blocks form
/// in the graph.
pub fn detect_hot_code(graph: &Graph, hot_threshold: f32) -> Vec<HotRegion> {
    let mut frequencies: BTreeMap<BlockId, (u64, NodeId)> = BTreeMap::new();
    for n in graph.node_ids() {
        let block = match graph.node(n).newest_block() {
            Some(b) => b,
            None => continue,
        };
        let freq: u64 = graph
            .preds(n)
            .iter()
            .map(|e| graph.edge(*e).freq())
            .sum();
        let entry = frequencies.entry(block).or_insert((0, n));
        entry.0 += freq;
    }

    let total: u64 = frequencies.values().map(|(f, _)| *f).sum();
    if total == 0 {
        return Vec::new();
    }

    let mut ranked: Vec<(BlockId, u64, NodeId)> = frequencies
        .into_iter()
        .map(|(b, (f, n))| (b, f, n))
        .collect();
    // descending by frequency, block ID breaking ties for stable output
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut hot: BTreeMap<BlockId, NodeId> = BTreeMap::new();
    let mut covered = 0.0f32;
    for (block, freq, node) in ranked {
        if freq <= MIN_HOT_FREQUENCY {
            break;
        }
        hot.insert(block, node);
        covered += freq as f32 / total as f32;
        if covered >= hot_threshold {
            break;
        }
    }

    // partition hot blocks into adjacency-connected regions
    let hot_nodes: BTreeSet<NodeId> = hot.values().copied().collect();
    let mut assigned: BTreeSet<NodeId> = BTreeSet::new();
    let mut regions = Vec::new();
    for (block, node) in &hot {
        if assigned.contains(node) {
            continue;
        }
        let mut region = HotRegion::default();
        let mut queue = vec![(*block, *node)];
        while let Some((b, n)) = queue.pop() {
            if !assigned.insert(n) {
                continue;
            }
            region.blocks.insert(b);
            region.nodes.insert(n);
            for e in graph.succs(n).into_iter().chain(graph.preds(n)) {
                let edge = graph.edge(e);
                for neighbor in [edge.src, edge.snk] {
                    if hot_nodes.contains(&neighbor) && !assigned.contains(&neighbor) {
                        if let Some(nb) = graph.node(neighbor).newest_block() {
                            queue.push((nb, neighbor));
                        }
                    }
                }
            }
        }
        regions.push(region);
    }

    info!(
        regions = regions.len(),
        hot_blocks = hot.len(),
        "hot code detection complete"
    );
    regions
}

/// One pseudo-task per loop whose body is majority-hot
pub fn detect_hot_loops(
    regions: &[HotRegion],
    graph: &Graph,
    loops: &LoopInfo,
) -> Vec<HotRegion> {
    let hot_blocks: BTreeSet<BlockId> = regions
        .iter()
        .flat_map(|r| r.blocks.iter().copied())
        .collect();

    let mut node_of: BTreeMap<BlockId, NodeId> = BTreeMap::new();
    for n in graph.node_ids() {
        if let Some(b) = graph.node(n).newest_block() {
            node_of.insert(b, n);
        }
    }

    let mut out = Vec::new();
    for l in &loops.loops {
        if l.blocks.is_empty() {
            continue;
        }
        let hot_count = l.blocks.iter().filter(|b| hot_blocks.contains(b)).count();
        if hot_count * 2 <= l.blocks.len() {
            continue;
        }
        let mut region = HotRegion::default();
        for b in &l.blocks {
            region.blocks.insert(*b);
            if let Some(n) = node_of.get(b) {
                region.nodes.insert(*n);
            }
        }
        out.push(region);
    }
    info!(loops = out.len(), "hot loop detection complete");
    out
}

/// Share of total block frequency covered by the given regions
pub fn coverage(graph: &Graph, regions: &[HotRegion]) -> f32 {
    let mut total = 0u64;
    let mut hot = 0u64;
    let hot_nodes: BTreeSet<NodeId> = regions
        .iter()
        .flat_map(|r| r.nodes.iter().copied())
        .collect();
    for n in graph.node_ids() {
        let freq: u64 = graph
            .preds(n)
            .iter()
            .map(|e| graph.edge(*e).freq())
            .sum();
        total += freq;
        if hot_nodes.contains(&n) {
            hot += freq;
        }
    }
    if total == 0 {
        0.0
    } else {
        hot as f32 / total as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testutil::{chain_graph, weigh};
    use crate::ir::LoopEntry;

    /// A hot loop 1 <-> 2 next to cold peripheral blocks
    fn hot_fixture() -> Graph {
        let (mut g, _ids) = chain_graph(&[
            (0, 1, 2),
            (1, 2, 5000),
            (2, 1, 4999),
            (2, 3, 1),
        ]);
        weigh(&mut g);
        g
    }

    #[test]
    fn test_hot_blocks_grouped() {
        let g = hot_fixture();
        let regions = detect_hot_code(&g, 0.95);
        assert_eq!(regions.len(), 1);
        let blocks: Vec<i64> = regions[0].blocks.iter().map(|b| b.0).collect();
        assert_eq!(blocks, vec![1, 2]);
    }

    #[test]
    fn test_coverage_meets_threshold() {
        let g = hot_fixture();
        let regions = detect_hot_code(&g, 0.95);
        assert!(coverage(&g, &regions) >= 0.95);
    }

    #[test]
    fn test_cold_graph_has_no_regions() {
        let (mut g, _ids) = chain_graph(&[(0, 1, 2), (1, 2, 3)]);
        weigh(&mut g);
        assert!(detect_hot_code(&g, 0.95).is_empty());
    }

    #[test]
    fn test_hot_loops_from_loop_info() {
        let g = hot_fixture();
        let regions = detect_hot_code(&g, 0.95);
        let loops = LoopInfo {
            loops: vec![
                LoopEntry {
                    id: 0,
                    blocks: vec![BlockId(1), BlockId(2)],
                    loop_type: 0,
                },
                LoopEntry {
                    id: 1,
                    blocks: vec![BlockId(0), BlockId(3)],
                    loop_type: 0,
                },
            ],
        };
        let hot_loops = detect_hot_loops(&regions, &g, &loops);
        assert_eq!(hot_loops.len(), 1);
        assert!(hot_loops[0].blocks.contains(&BlockId(1)));
    }
}
