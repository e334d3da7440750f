//! Kernel file assembly
//!
//! The final JSON describes every discovered task: its nodes and blocks,
//! the concrete block-to-block edges crossing its boundary, its position
//! in the task hierarchy, and which tasks dominate it. Entropy statistics
//! and the run's warning count ride along.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::entropy::EntropyInfo;
use crate::graph::{EdgeId, Graph, NodeId, TaskId};
use crate::hotcode::HotRegion;
use crate::ir::{BlockInfo, IrProvider};
use crate::segment::Segmentation;
use crate::transforms::reverse_to_tasks;
use crate::warnings;

/// Concrete block pairs beneath a possibly-nested boundary edge
///
/// Virtual edges are peeled until an edge with concrete endpoint
/// histories appears; imaginary edges contribute nothing.
fn original_block_pairs(graph: &Graph, edge: EdgeId) -> BTreeSet<(i64, i64)> {
    let mut pairs = BTreeSet::new();
    let mut queue = vec![edge];
    while let Some(e) = queue.pop() {
        let edge = graph.edge(e);
        if let Some(underlying) = edge.underlying() {
            queue.extend(underlying.iter().copied());
            continue;
        }
        if edge.is_imaginary() {
            continue;
        }
        let src = graph.node(edge.src).newest_block();
        let snk = graph.node(edge.snk).newest_block();
        if let (Some(s), Some(t)) = (src, snk) {
            pairs.insert((s.0, t.0));
        }
    }
    pairs
}

fn boundary_json(graph: &Graph, edges: &[EdgeId]) -> Value {
    let mut map: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    for e in edges {
        for (src, snk) in original_block_pairs(graph, *e) {
            map.entry(src.to_string()).or_default().push(snk);
        }
    }
    for v in map.values_mut() {
        v.sort();
        v.dedup();
    }
    json!(map)
}

/// Blocks of everything outside any task, descending through plain
/// virtual layers but never into a task
fn non_kernel_blocks(graph: &Graph) -> BTreeSet<i64> {
    let mut out = BTreeSet::new();
    for n in graph.node_ids() {
        let node = graph.node(n);
        if node.is_cycle() {
            continue;
        }
        let mut queue = vec![n];
        while let Some(q) = queue.pop() {
            let qn = graph.node(q);
            if q != n && qn.is_cycle() {
                continue;
            }
            match qn.virtual_data() {
                Some(v) => queue.extend(v.subgraph.iter().copied()),
                None => out.extend(qn.blocks().iter().map(|b| b.0)),
            }
        }
    }
    out
}

/// Task dominators on the task-level view of the graph
///
/// A breadth-first walk from the program entrance tags each task with
/// every task seen before it; a task's nested children inherit it as a
/// dominator too.
fn dominators(graph: &Graph, seg: &Segmentation) -> BTreeMap<TaskId, BTreeSet<TaskId>> {
    let mut unrolled = graph.clone();
    reverse_to_tasks(&mut unrolled);

    let mut doms: BTreeMap<TaskId, BTreeSet<TaskId>> = BTreeMap::new();
    for kid in seg.by_kid.keys() {
        doms.insert(*kid, BTreeSet::new());
    }

    let start = match unrolled
        .entry_node()
        .or_else(|| unrolled.node_ids().first().copied())
    {
        Some(s) => s,
        None => return doms,
    };
    let mut seen: BTreeSet<TaskId> = BTreeSet::new();
    let mut covered: BTreeSet<NodeId> = BTreeSet::new();
    let mut queue = std::collections::VecDeque::new();
    queue.push_back(start);
    covered.insert(start);
    while let Some(n) = queue.pop_front() {
        if let Some(cycle) = unrolled.node(n).as_cycle() {
            doms.entry(cycle.kid)
                .or_default()
                .extend(seen.iter().copied());
            seen.insert(cycle.kid);
            // everything nested under this task is dominated by it
            let mut hierarchy: Vec<TaskId> = cycle.children.iter().copied().collect();
            while let Some(child) = hierarchy.pop() {
                doms.entry(child).or_default().insert(cycle.kid);
                if let Some(cn) = seg.by_kid.get(&child) {
                    if let Some(cc) = unrolled.node(*cn).as_cycle() {
                        hierarchy.extend(cc.children.iter().copied());
                    }
                }
            }
        }
        for e in unrolled.succs(n) {
            let snk = unrolled.edge(e).snk;
            if covered.insert(snk) {
                queue.push_back(snk);
            }
        }
    }
    doms
}

fn valid_blocks_json(ir: &dyn IrProvider) -> Value {
    let mut valid_blocks: Vec<i64> = Vec::new();
    for f in ir.functions() {
        valid_blocks.extend(ir.blocks(f).iter().map(|b| b.0));
    }
    valid_blocks.sort();
    json!(valid_blocks)
}

fn block_callers_json(block_info: &BlockInfo) -> Value {
    let callers: BTreeMap<String, Vec<i64>> = block_info
        .blocks
        .iter()
        .filter(|(_, e)| !e.block_callers.is_empty())
        .map(|(b, e)| {
            (
                b.0.to_string(),
                e.block_callers.iter().map(|c| c.0).collect(),
            )
        })
        .collect();
    json!(callers)
}

/// Assemble the kernel file for a structured run
pub fn kernel_file(
    graph: &Graph,
    seg: &Segmentation,
    ir: &dyn IrProvider,
    block_info: &BlockInfo,
    entropy: &EntropyInfo,
) -> Value {
    let mut root = Map::new();
    root.insert("ValidBlocks".to_string(), valid_blocks_json(ir));
    root.insert("BlockCallers".to_string(), block_callers_json(block_info));
    root.insert("Entropy".to_string(), json!(entropy));

    // sequential IDs in task-discovery order
    let seq: BTreeMap<TaskId, usize> = seg
        .kernels
        .iter()
        .enumerate()
        .filter_map(|(i, n)| graph.node(*n).as_cycle().map(|c| (c.kid, i)))
        .collect();

    let doms = dominators(graph, seg);
    let mut kernels = Map::new();
    let mut total_nodes = 0.0f64;
    let mut total_blocks = 0.0f64;
    for vn in &seg.kernels {
        let cycle = match graph.node(*vn).as_cycle() {
            Some(c) => c,
            None => continue,
        };
        let sid = seq[&cycle.kid];
        total_nodes += cycle.virt.subgraph.len() as f64;
        total_blocks += cycle.virt.blocks.len() as f64;

        let mut entry = Map::new();
        entry.insert(
            "Nodes".to_string(),
            json!(cycle.virt.subgraph.iter().map(|n| n.0).collect::<Vec<_>>()),
        );
        entry.insert(
            "Blocks".to_string(),
            json!(cycle.virt.blocks.iter().map(|b| b.0).collect::<Vec<_>>()),
        );
        entry.insert("Labels".to_string(), json!(vec![cycle.label.clone()]));
        entry.insert(
            "Entrances".to_string(),
            boundary_json(graph, &graph.preds(*vn)),
        );
        entry.insert("Exits".to_string(), boundary_json(graph, &graph.succs(*vn)));
        entry.insert(
            "Children".to_string(),
            json!(cycle
                .children
                .iter()
                .filter_map(|k| seq.get(k))
                .collect::<Vec<_>>()),
        );
        entry.insert(
            "Parents".to_string(),
            json!(cycle
                .parents
                .iter()
                .filter_map(|k| seq.get(k))
                .collect::<Vec<_>>()),
        );
        entry.insert(
            "Dominators".to_string(),
            json!(doms
                .get(&cycle.kid)
                .map(|d| d.iter().filter_map(|k| seq.get(k)).collect::<Vec<_>>())
                .unwrap_or_default()),
        );
        kernels.insert(sid.to_string(), Value::Object(entry));
    }
    root.insert("Kernels".to_string(), Value::Object(kernels));
    root.insert(
        "NonKernelBlocks".to_string(),
        json!(non_kernel_blocks(graph)),
    );

    let count = seg.kernels.len() as f64;
    root.insert(
        "Average Kernel Size (Nodes)".to_string(),
        json!(if count > 0.0 { total_nodes / count } else { 0.0 }),
    );
    root.insert(
        "Average Kernel Size (Blocks)".to_string(),
        json!(if count > 0.0 { total_blocks / count } else { 0.0 }),
    );
    root.insert("Warnings".to_string(), json!(warnings::count()));

    debug!(kernels = seg.kernels.len(), "kernel file assembled");
    Value::Object(root)
}

/// Assemble a kernel file from hot regions instead of structured tasks
pub fn hot_kernel_file(regions: &[HotRegion], ir: &dyn IrProvider, block_info: &BlockInfo) -> Value {
    let mut root = Map::new();
    root.insert("ValidBlocks".to_string(), valid_blocks_json(ir));
    root.insert("BlockCallers".to_string(), block_callers_json(block_info));

    let mut kernels = Map::new();
    let mut hot_blocks: BTreeSet<i64> = BTreeSet::new();
    let mut total_nodes = 0.0f64;
    let mut total_blocks = 0.0f64;
    for (i, region) in regions.iter().enumerate() {
        total_nodes += region.nodes.len() as f64;
        total_blocks += region.blocks.len() as f64;
        hot_blocks.extend(region.blocks.iter().map(|b| b.0));
        let mut entry = Map::new();
        entry.insert(
            "Nodes".to_string(),
            json!(region.nodes.iter().map(|n| n.0).collect::<Vec<_>>()),
        );
        entry.insert(
            "Blocks".to_string(),
            json!(region.blocks.iter().map(|b| b.0).collect::<Vec<_>>()),
        );
        entry.insert("Labels".to_string(), json!(vec![String::new()]));
        entry.insert("Entrances".to_string(), json!({}));
        entry.insert("Exits".to_string(), json!({}));
        entry.insert("Children".to_string(), Value::Array(Vec::new()));
        entry.insert("Parents".to_string(), Value::Array(Vec::new()));
        kernels.insert(i.to_string(), Value::Object(entry));
    }
    root.insert("Kernels".to_string(), Value::Object(kernels));

    let non_kernel: BTreeSet<i64> = ir
        .functions()
        .into_iter()
        .flat_map(|f| ir.blocks(f))
        .map(|b| b.0)
        .filter(|b| !hot_blocks.contains(b))
        .collect();
    root.insert("NonKernelBlocks".to_string(), json!(non_kernel));

    let count = regions.len() as f64;
    root.insert(
        "Average Kernel Size (Nodes)".to_string(),
        json!(if count > 0.0 { total_nodes / count } else { 0.0 }),
    );
    root.insert(
        "Average Kernel Size (Blocks)".to_string(),
        json!(if count > 0.0 { total_blocks / count } else { 0.0 }),
    );
    root.insert("Warnings".to_string(), json!(warnings::count()));
    Value::Object(root)
}
