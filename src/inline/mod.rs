//! Shared-function virtualization
//!
//! A function called from several sites appears once in the profile, so
//! its body would blend every calling context together. This pass inlines
//! each call site: the callee subgraph is copied into one virtual node
//! per interior node and per site, boundary edges become virtual edges,
//! and the shared originals leave the visible graph once every site has
//! its copy. Later transforms then see a distinct body per call context,
//! and the reverse transform recovers the context a node belonged to.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{debug, info};

use crate::callgraph::DynamicCallGraph;
use crate::graph::{EdgeId, EdgeKind, Graph, NodeId, VirtualData};
use crate::ir::FunctionId;

/// Inline every shared function, children before callers
pub fn virtualize_shared_functions(graph: &mut Graph, cg: &DynamicCallGraph, main: FunctionId) {
    let schedule = cg.inline_schedule(main);
    if schedule.is_empty() {
        return;
    }
    info!(entries = schedule.len(), "inlining shared functions");

    for sites in schedule {
        let sites: Vec<EdgeId> = sites
            .into_iter()
            .filter(|e| graph.contains_edge(*e))
            .collect();
        if sites.len() < 2 {
            continue;
        }

        // the boundary: every observed return edge of every site
        let mut boundary: BTreeSet<EdgeId> = BTreeSet::new();
        for site in &sites {
            if let Some(returns) = graph.edge(*site).returns() {
                boundary.extend(returns.dynamic_rets.iter().copied());
            }
        }

        // the shared body is the same region regardless of site; collect
        // the union so the originals can be retired afterwards
        let mut region_union: BTreeSet<NodeId> = BTreeSet::new();
        for site in &sites {
            let entry = graph.edge(*site).snk;
            let region = discover_region(graph, entry, &boundary, &sites);
            let tailored = tailor_region(graph, region, *site);
            if !tailored.contains(&entry) {
                crate::warnings::note(&format!(
                    "call site edge {} has no path from entry to an observed exit",
                    site.0
                ));
                continue;
            }
            region_union.extend(tailored.iter().copied());
            inline_site(graph, *site, &tailored, &boundary);
        }

        retire_originals(graph, &region_union);
    }
}

/// Forward reachability from the callee entry, stopped at return edges
fn discover_region(
    graph: &Graph,
    entry: NodeId,
    boundary: &BTreeSet<EdgeId>,
    sites: &[EdgeId],
) -> BTreeSet<NodeId> {
    let mut region = BTreeSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(entry);
    while let Some(n) = queue.pop_front() {
        if !region.insert(n) {
            continue;
        }
        for e in graph.succs(n) {
            if boundary.contains(&e) || sites.contains(&e) {
                continue;
            }
            let edge = graph.edge(e);
            if edge.is_imaginary() {
                continue;
            }
            if !region.contains(&edge.snk) {
                queue.push_back(edge.snk);
            }
        }
    }
    region
}

/// Drop region nodes that this call site cannot actually reach on the
/// way to one of its observed exits
fn tailor_region(graph: &Graph, region: BTreeSet<NodeId>, site: EdgeId) -> BTreeSet<NodeId> {
    let exit_srcs: Vec<NodeId> = graph
        .edge(site)
        .returns()
        .map(|r| {
            r.dynamic_rets
                .iter()
                .map(|e| graph.edge(*e).src)
                .filter(|n| region.contains(n))
                .collect()
        })
        .unwrap_or_default();
    if exit_srcs.is_empty() {
        // nothing returned at this site (an exit() path, most likely);
        // keep the forward-reachable set as is
        return region;
    }

    let mut backward = BTreeSet::new();
    let mut queue: VecDeque<NodeId> = exit_srcs.into_iter().collect();
    while let Some(n) = queue.pop_front() {
        if !backward.insert(n) {
            continue;
        }
        for e in graph.preds(n) {
            let src = graph.edge(e).src;
            if region.contains(&src) && !backward.contains(&src) {
                queue.push_back(src);
            }
        }
    }
    region.intersection(&backward).copied().collect()
}

/// Copy the tailored region into per-node virtual nodes for one site
fn inline_site(graph: &mut Graph, site: EdgeId, region: &BTreeSet<NodeId>, boundary: &BTreeSet<EdgeId>) {
    let (caller, entry, site_freq) = {
        let e = graph.edge(site);
        (e.src, e.snk, e.freq())
    };
    debug!(
        caller = caller.0,
        entry = entry.0,
        nodes = region.len(),
        "inlining call site"
    );

    // one fresh virtual node per interior node keeps the call context
    // recoverable through the reverse transform
    let mut copy: BTreeMap<NodeId, NodeId> = BTreeMap::new();
    for n in region {
        let data = VirtualData {
            subgraph: [*n].into_iter().collect(),
            sub_edges: BTreeSet::new(),
            blocks: graph.node(*n).blocks(),
            anchor: graph.incoming_freq_all(*n),
        };
        copy.insert(*n, graph.add_virtual_node(data));
    }

    // interior edges become virtual edges between the copies
    for n in region {
        for e in graph.succs(*n) {
            if boundary.contains(&e) {
                continue;
            }
            let (snk, freq, weight) = {
                let edge = graph.edge(e);
                (edge.snk, edge.freq(), edge.weight())
            };
            if !region.contains(&snk) {
                continue;
            }
            let ve = graph.add_edge(
                copy[n],
                copy[&snk],
                EdgeKind::Virtual {
                    freq,
                    weight: 0.0,
                    underlying: [e].into_iter().collect(),
                },
            );
            graph.edge_mut(ve).set_weight(weight);
        }
    }

    // the entrance: the call edge itself, re-aimed at this site's copy
    let caller_total = graph.outgoing_freq(caller);
    graph.hide_edge(site);
    graph.remove_successor(caller, site);
    let ent = graph.add_edge(
        caller,
        copy[&entry],
        EdgeKind::Virtual {
            freq: site_freq,
            weight: 0.0,
            underlying: [site].into_iter().collect(),
        },
    );
    graph.edge_mut(ent).set_weight_from_total(caller_total);

    // the exits: this site's observed return edges
    let rets: Vec<EdgeId> = graph
        .edge(site)
        .returns()
        .map(|r| r.dynamic_rets.iter().copied().collect())
        .unwrap_or_default();
    for r in rets {
        if !graph.contains_edge(r) {
            continue;
        }
        let (src, snk, freq, weight) = {
            let e = graph.edge(r);
            (e.src, e.snk, e.freq(), e.weight())
        };
        if !region.contains(&src) {
            continue;
        }
        graph.hide_edge(r);
        graph.remove_predecessor(snk, r);
        let ve = graph.add_edge(
            copy[&src],
            snk,
            EdgeKind::Virtual {
                freq,
                weight: 0.0,
                underlying: [r].into_iter().collect(),
            },
        );
        graph.edge_mut(ve).set_weight(weight);
    }

    // partitioning the exits across sites changes each copy's outgoing
    // totals; re-derive the branch probabilities per copy
    for vn in copy.values() {
        graph.renormalize_succs(*vn);
    }
}

/// Hide the shared originals once every site has its copy
fn retire_originals(graph: &mut Graph, region: &BTreeSet<NodeId>) {
    for n in region {
        for e in graph.succs(*n) {
            if region.contains(&graph.edge(e).snk) {
                graph.hide_edge(e);
            }
        }
        graph.hide_node(*n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{classify, BlockNodeMap};
    use crate::ir::testutil::{call_block, ret_block};
    use crate::ir::{BlockId, BlockInfo, FunctionDef, IrProvider, Module};
    use crate::profile::{load_bytes, write_order1};
    use crate::transforms::checks::verify;
    use crate::transforms::virtualize::reverse_full;

    /// main calls f from two sites; f is blocks 10 -> 11
    fn shared_fixture() -> (Graph, Module, BlockNodeMap) {
        let module = Module::from_functions(vec![
            FunctionDef {
                name: "main".to_string(),
                blocks: vec![
                    call_block(0, "f", &[1]),
                    call_block(1, "f", &[2]),
                    ret_block(2),
                ],
            },
            FunctionDef {
                name: "f".to_string(),
                blocks: vec![crate::ir::testutil::block(10, &[11]), ret_block(11)],
            },
        ])
        .unwrap();

        let bytes = write_order1(&[
            (0, 10, 5),
            (10, 11, 10),
            (11, 1, 5),
            (1, 10, 5),
            (11, 2, 5),
        ]);
        let raw = load_bytes(&bytes, false).unwrap();
        let mut graph = raw.graph;
        classify(&mut graph, &raw.nid_map, &module, &BlockInfo::default()).unwrap();
        let block_nodes = BlockNodeMap::build(&raw.nid_map);
        (graph, module, block_nodes)
    }

    #[test]
    fn test_shared_function_inlined_per_site() {
        let (mut graph, module, block_nodes) = shared_fixture();
        let cg = DynamicCallGraph::build(&graph, &module, &BlockInfo::default(), &block_nodes);
        let main = module.main_function().unwrap();

        let n10 = block_nodes.nodes_of(BlockId(10))[0];
        let n11 = block_nodes.nodes_of(BlockId(11))[0];
        let before_nodes = graph.node_count();

        virtualize_shared_functions(&mut graph, &cg, main);

        // the shared body is gone from the top level, two copies exist
        assert!(!graph.contains_node(n10));
        assert!(!graph.contains_node(n11));
        let copies = graph.nodes().filter(|n| n.is_virtual()).count();
        assert_eq!(copies, 4, "two nodes copied once per site");
        // node count: -2 originals +4 copies
        assert_eq!(graph.node_count(), before_nodes + 2);

        // each caller flows into its own copy and back out
        assert!(verify(&graph, "inline", false).is_ok());
    }

    #[test]
    fn test_inline_round_trips() {
        let (mut graph, module, block_nodes) = shared_fixture();
        let cg = DynamicCallGraph::build(&graph, &module, &BlockInfo::default(), &block_nodes);
        let main = module.main_function().unwrap();

        let before: Vec<_> = graph.edge_ids();
        virtualize_shared_functions(&mut graph, &cg, main);
        reverse_full(&mut graph);
        assert_eq!(graph.edge_ids(), before);
    }

    #[test]
    fn test_single_site_function_untouched() {
        let module = Module::from_functions(vec![
            FunctionDef {
                name: "main".to_string(),
                blocks: vec![call_block(0, "f", &[1]), ret_block(1)],
            },
            FunctionDef {
                name: "f".to_string(),
                blocks: vec![ret_block(10)],
            },
        ])
        .unwrap();
        let bytes = write_order1(&[(0, 10, 3), (10, 1, 3)]);
        let raw = load_bytes(&bytes, false).unwrap();
        let mut graph = raw.graph;
        classify(&mut graph, &raw.nid_map, &module, &BlockInfo::default()).unwrap();
        let block_nodes = BlockNodeMap::build(&raw.nid_map);
        let cg = DynamicCallGraph::build(&graph, &module, &BlockInfo::default(), &block_nodes);

        let before = graph.node_count();
        virtualize_shared_functions(&mut graph, &cg, module.main_function().unwrap());
        assert_eq!(graph.node_count(), before);
    }
}
