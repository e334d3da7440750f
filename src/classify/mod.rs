//! Edge classification
//!
//! The raw profile only knows unconditional transitions. This pass walks
//! the IR and upgrades edges in stages: branching nodes get weighted
//! conditional edges, call sites become call edges with a reconstructed
//! return record, every remaining profile edge into a function entry is
//! patched into a call edge, observed callee-exit transitions become
//! return edges, and imaginary anchors mark program entry and exit. A
//! final cleanup drops call edges that only look recursive because the
//! profiler cannot see through dead callers.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{debug, info};

use crate::callgraph::DynamicCallGraph;
use crate::graph::{EdgeId, EdgeKind, Graph, NodeId, Returns};
use crate::ir::{BlockId, BlockInfo, FunctionId, IrError, IrProvider};
use crate::profile::NidMap;
use crate::warnings;

/// Maps a basic block to every node whose newest history entry is it
///
/// At markov order 1 this is one-to-one; at higher orders one block fans
/// out to every history tuple that ends in it.
#[derive(Debug, Default)]
pub struct BlockNodeMap {
    map: BTreeMap<BlockId, Vec<NodeId>>,
}

impl BlockNodeMap {
    pub fn build(nid_map: &NidMap) -> Self {
        let mut map: BTreeMap<BlockId, Vec<NodeId>> = BTreeMap::new();
        for (history, node) in nid_map {
            if let Some(newest) = history.last() {
                map.entry(*newest).or_default().push(*node);
            }
        }
        for nodes in map.values_mut() {
            nodes.sort();
        }
        BlockNodeMap { map }
    }

    pub fn nodes_of(&self, b: BlockId) -> &[NodeId] {
        self.map.get(&b).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn observed(&self, b: BlockId) -> bool {
        self.map.contains_key(&b)
    }

    pub fn blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.map.keys().copied()
    }
}

/// Run every classification step over a freshly loaded profile graph
///
/// Returns the terminator node (the observed program exit inside `main`).
pub fn classify(
    graph: &mut Graph,
    nid_map: &NidMap,
    ir: &dyn IrProvider,
    block_info: &BlockInfo,
) -> Result<NodeId, IrError> {
    ir_supported(ir)?;
    let block_nodes = BlockNodeMap::build(nid_map);
    for b in block_nodes.blocks() {
        if ir.function_for_block(b).is_none() {
            return Err(IrError::UnknownBlockId(b));
        }
    }

    upgrade_conditionals(graph);
    upgrade_calls(graph, ir, block_info, &block_nodes)?;
    patch_function_edges(graph, ir, block_info, &block_nodes);
    let terminator = add_imaginary_anchors(graph, ir, block_info, &block_nodes)?;
    info!(
        nodes = graph.node_count(),
        edges = graph.edge_count(),
        "edge classification complete"
    );
    Ok(terminator)
}

fn ir_supported(ir: &dyn IrProvider) -> Result<(), IrError> {
    use crate::ir::Terminator;
    for f in ir.functions() {
        for b in ir.blocks(f) {
            if let Some(def) = ir.block(b) {
                match def.terminator {
                    Terminator::Callbr => {
                        return Err(IrError::UnsupportedTerminator(b, "callbr"))
                    }
                    Terminator::Statepoint => {
                        return Err(IrError::UnsupportedTerminator(b, "statepoint"))
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Step 1: conditional upgrade
// ----------------------------------------------------------------------

/// Upgrade the outgoing edges of branching nodes to weighted conditionals
///
/// A node branches when its block's terminator has two or more static
/// successors, and also when the profile shows fan-out the static code
/// does not explain (empty-function and function-pointer callees); both
/// cases reduce to the node having more than one observed successor.
fn upgrade_conditionals(graph: &mut Graph) {
    for node in graph.node_ids() {
        let succs = graph.succs(node);
        if succs.len() < 2 {
            continue;
        }
        let total: u64 = succs.iter().map(|e| graph.edge(*e).freq()).sum();
        for e in succs {
            let edge = graph.edge(e);
            if !matches!(edge.kind, EdgeKind::Unconditional { .. }) {
                continue;
            }
            let (src, snk, freq) = (edge.src, edge.snk, edge.freq());
            graph.detach_edge(e);
            let ne = graph.add_edge(src, snk, EdgeKind::Conditional { freq, weight: 0.0 });
            graph.edge_mut(ne).set_weight_from_total(total);
        }
    }
}

// ----------------------------------------------------------------------
// Step 2 and 3: call upgrade and dynamic-return rewrite
// ----------------------------------------------------------------------

/// Resolve the destination blocks of one call instruction
fn callee_blocks(
    caller_block: BlockId,
    callee: Option<&str>,
    ir: &dyn IrProvider,
    block_info: &BlockInfo,
) -> Result<Vec<BlockId>, IrError> {
    if let Some(name) = callee {
        match ir.function_by_name(name) {
            Some(f) if !ir.is_empty(f) => Ok(ir.entry_block(f).into_iter().collect()),
            // external function, invisible to the profile
            Some(_) => Ok(vec![]),
            None => Err(IrError::UnresolvableCallee(caller_block, name.to_string())),
        }
    } else {
        // function pointer: the profiler tells us where control went
        let observed = block_info.callers_of(caller_block);
        if observed.is_empty() {
            warnings::note(&format!(
                "no dynamic callee information for indirect call in block {}",
                caller_block.0
            ));
        }
        Ok(observed.to_vec())
    }
}

/// Collect the nodes of a function and of everything it transitively calls
fn function_nodes(
    callee: FunctionId,
    ir: &dyn IrProvider,
    block_info: &BlockInfo,
    block_nodes: &BlockNodeMap,
) -> BTreeSet<NodeId> {
    let mut nodes = BTreeSet::new();
    let mut queue = VecDeque::new();
    let mut covered = BTreeSet::new();
    queue.push_back(callee);
    covered.insert(callee);
    while let Some(f) = queue.pop_front() {
        for b in ir.blocks(f) {
            nodes.extend(block_nodes.nodes_of(b).iter().copied());
            let def = match ir.block(b) {
                Some(d) => d,
                None => continue,
            };
            for inst in &def.instructions {
                if !inst.is_call() {
                    continue;
                }
                let targets: Vec<FunctionId> = match &inst.callee {
                    Some(name) => ir.function_by_name(name).into_iter().collect(),
                    None => block_info
                        .callers_of(b)
                        .iter()
                        .filter_map(|cb| ir.function_for_block(*cb))
                        .collect(),
                };
                for t in targets {
                    if !ir.is_empty(t) && covered.insert(t) {
                        queue.push_back(t);
                    }
                }
            }
        }
    }
    nodes
}

/// Build the return record for a call from `caller_node` into `callee`
fn build_returns(
    graph: &mut Graph,
    ir: &dyn IrProvider,
    block_info: &BlockInfo,
    block_nodes: &BlockNodeMap,
    caller_node: NodeId,
    caller_block: BlockId,
    callee: FunctionId,
    freq: u64,
) -> Returns {
    let mut returns = Returns {
        caller_node: Some(caller_node),
        function: Some(callee),
        function_nodes: function_nodes(callee, ir, block_info, block_nodes),
        ..Returns::default()
    };
    let caller_succ_blocks: Vec<BlockId> = ir
        .block(caller_block)
        .map(|d| d.terminator.successors().to_vec())
        .unwrap_or_default();

    for cb in ir.blocks(callee) {
        let exits_fn = ir
            .block(cb)
            .map(|d| d.terminator.is_function_exit())
            .unwrap_or(false);
        if !exits_fn {
            continue;
        }
        for exit_node in block_nodes.nodes_of(cb).to_vec() {
            returns.static_exits.insert(exit_node);
            let sret = graph.add_detached_edge(
                exit_node,
                caller_node,
                EdgeKind::Unconditional { freq },
            );
            returns.static_rets.insert(sret);
            // the profile encodes the return as exit -> caller successor
            for sb in &caller_succ_blocks {
                for succ_node in block_nodes.nodes_of(*sb).to_vec() {
                    if let Some(ret) = graph.find_edge_between(exit_node, succ_node) {
                        returns.dynamic_rets.insert(ret);
                        returns.dynamic_exits.insert(succ_node);
                    }
                }
            }
        }
    }
    if returns.dynamic_rets.is_empty() {
        debug!(
            caller = caller_block.0,
            callee = ?ir.function_name(callee),
            "call with no exercised return edge"
        );
    }
    returns
}

/// Replace a raw profile edge with a call edge and rewrite its observed
/// return transitions
fn install_call_edge(
    graph: &mut Graph,
    ir: &dyn IrProvider,
    block_info: &BlockInfo,
    block_nodes: &BlockNodeMap,
    eid: EdgeId,
    caller_block: BlockId,
    callee: FunctionId,
) {
    let (caller_node, callee_node, freq) = {
        let e = graph.edge(eid);
        (e.src, e.snk, e.freq())
    };
    let returns = build_returns(
        graph,
        ir,
        block_info,
        block_nodes,
        caller_node,
        caller_block,
        callee,
        freq,
    );
    graph.detach_edge(eid);
    let call_edge = graph.add_edge(
        caller_node,
        callee_node,
        EdgeKind::Call {
            freq,
            weight: 0.0,
            returns,
        },
    );
    rewrite_dynamic_returns(graph, call_edge);
    graph.renormalize_succs(caller_node);
}

fn upgrade_calls(
    graph: &mut Graph,
    ir: &dyn IrProvider,
    block_info: &BlockInfo,
    block_nodes: &BlockNodeMap,
) -> Result<(), IrError> {
    for f in ir.functions() {
        for b in ir.blocks(f) {
            let def = match ir.block(b) {
                Some(d) => d.clone(),
                None => continue,
            };
            if !block_nodes.observed(b) {
                continue;
            }
            for inst in &def.instructions {
                if !inst.is_call() {
                    continue;
                }
                let destinations = match callee_blocks(b, inst.callee.as_deref(), ir, block_info)
                {
                    Ok(d) => d,
                    Err(IrError::UnresolvableCallee(block, name)) => {
                        warnings::note(&format!(
                            "call in block {} names unknown function `{}`",
                            block.0, name
                        ));
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                for entry_block in destinations {
                    let callee = match ir.function_for_block(entry_block) {
                        Some(c) => c,
                        None => {
                            warnings::note(&format!(
                                "observed callee block {} belongs to no known function",
                                entry_block.0
                            ));
                            continue;
                        }
                    };
                    for caller_node in block_nodes.nodes_of(b).to_vec() {
                        for callee_node in block_nodes.nodes_of(entry_block).to_vec() {
                            let eid =
                                match graph.find_edge_between(caller_node, callee_node) {
                                    Some(e) => e,
                                    None => continue,
                                };
                            if graph.edge(eid).is_call() {
                                continue;
                            }
                            install_call_edge(
                                graph, ir, block_info, block_nodes, eid, b, callee,
                            );
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Upgrade any remaining profile edge into a function entry to a call
///
/// Calls made from inside unprofiled code (dead callers, library
/// trampolines) leave edges that no call instruction explains. Every
/// predecessor of a function entry node must still be a call edge for
/// the downstream passes, so they are patched here.
fn patch_function_edges(
    graph: &mut Graph,
    ir: &dyn IrProvider,
    block_info: &BlockInfo,
    block_nodes: &BlockNodeMap,
) {
    for f in ir.functions() {
        if ir.is_empty(f) || ir.function_name(f) == "main" {
            continue;
        }
        let entry_block = match ir.entry_block(f) {
            Some(b) => b,
            None => continue,
        };
        for entry_node in block_nodes.nodes_of(entry_block).to_vec() {
            for pred in graph.preds(entry_node) {
                let edge = graph.edge(pred);
                if edge.is_call() || edge.is_imaginary() {
                    continue;
                }
                let caller_block = match graph.node(edge.src).newest_block() {
                    Some(b) => b,
                    None => continue,
                };
                debug!(
                    caller = caller_block.0,
                    callee = ir.function_name(f),
                    "patching unexplained function entry edge into a call"
                );
                install_call_edge(graph, ir, block_info, block_nodes, pred, caller_block, f);
            }
        }
    }
}

/// Replace each observed exit transition with a return edge pointing back
/// at its call
fn rewrite_dynamic_returns(graph: &mut Graph, call_edge: EdgeId) {
    let old_rets: Vec<EdgeId> = graph
        .edge(call_edge)
        .returns()
        .map(|r| r.dynamic_rets.iter().copied().collect())
        .unwrap_or_default();

    let mut new_rets = BTreeSet::new();
    for ret in old_rets {
        if !graph.contains_edge(ret) || graph.edge(ret).is_return() {
            new_rets.insert(ret);
            continue;
        }
        let (src, snk, freq) = {
            let e = graph.edge(ret);
            (e.src, e.snk, e.freq())
        };
        graph.detach_edge(ret);
        let ne = graph.add_edge(
            src,
            snk,
            EdgeKind::Return {
                freq,
                weight: 0.0,
                call: call_edge,
            },
        );
        graph.renormalize_succs(src);
        new_rets.insert(ne);
    }
    if let Some(returns) = graph.edge_mut(call_edge).returns_mut() {
        returns.dynamic_rets = new_rets;
    }
}

// ----------------------------------------------------------------------
// Imaginary anchors
// ----------------------------------------------------------------------

/// Anchor program entry and exit with imaginary nodes
///
/// The entry points at `main`'s first observed node. The terminator is
/// the node inside `main` with no successors; termination anywhere else
/// is not supported. Thread-entry functions route their exits to the
/// program exit as well, covering threads that never joined.
fn add_imaginary_anchors(
    graph: &mut Graph,
    ir: &dyn IrProvider,
    block_info: &BlockInfo,
    block_nodes: &BlockNodeMap,
) -> Result<NodeId, IrError> {
    let main = ir.main_function().ok_or(IrError::NoMain)?;
    let entry_block = ir.entry_block(main).ok_or(IrError::NoMain)?;
    let first_node = block_nodes
        .nodes_of(entry_block)
        .first()
        .copied()
        .ok_or(IrError::NoMain)?;
    // at higher markov orders the entry block fans out into several
    // history nodes; anchor every one the profile never entered
    let mut first_nodes: Vec<NodeId> = block_nodes
        .nodes_of(entry_block)
        .iter()
        .copied()
        .filter(|n| graph.preds(*n).is_empty())
        .collect();
    if first_nodes.is_empty() {
        first_nodes.push(first_node);
    }

    let entry = graph.add_imaginary_node();
    for n in first_nodes {
        graph.add_edge(entry, n, EdgeKind::Imaginary);
    }

    // the dynamic profile guarantees the successor-free node in main's
    // context is where the program stopped
    let mut terminator = None;
    'outer: for b in ir.blocks(main) {
        for node in block_nodes.nodes_of(b) {
            if graph.succs(*node).is_empty() {
                terminator = Some(*node);
                break 'outer;
            }
        }
    }
    let terminator = terminator.ok_or(IrError::TerminationOutsideMain)?;

    let exit = graph.add_imaginary_node();
    graph.add_edge(terminator, exit, EdgeKind::Imaginary);

    // threads may terminate without a join; their function exits also
    // flow to the program exit
    for tb in &block_info.thread_entrances {
        let tf = match ir.function_for_block(*tb) {
            Some(f) => f,
            None => continue,
        };
        for b in ir.blocks(tf) {
            let exits_fn = ir
                .block(b)
                .map(|d| d.terminator.is_function_exit())
                .unwrap_or(false);
            if !exits_fn {
                continue;
            }
            for node in block_nodes.nodes_of(b).to_vec() {
                if graph.find_edge_between(node, exit).is_none() {
                    graph.add_edge(node, exit, EdgeKind::Imaginary);
                }
            }
        }
    }
    Ok(terminator)
}

// ----------------------------------------------------------------------
// Fake recursion removal
// ----------------------------------------------------------------------

/// Drop tail-to-head call edges the profile invents around dead callers
///
/// When a dead function calls a live function multiple times in a row,
/// the profile shows the live function's exit jumping straight to its
/// own entry, which looks like recursion. The tell: the source block
/// returns, the sink is its function's entry, and the call graph shows
/// no recursion for the source's function.
pub fn remove_fake_recursion(graph: &mut Graph, cg: &DynamicCallGraph, ir: &dyn IrProvider) {
    let mut to_remove = Vec::new();
    for eid in graph.edge_ids() {
        let edge = graph.edge(eid);
        if edge.returns().is_none() {
            continue;
        }
        let src_block = match graph.node(edge.src).newest_block() {
            Some(b) => b,
            None => continue,
        };
        let snk_block = match graph.node(edge.snk).newest_block() {
            Some(b) => b,
            None => continue,
        };
        let src_function = match ir.function_for_block(src_block) {
            Some(f) => f,
            None => continue,
        };
        if cg.is_recursive(src_function) {
            continue;
        }
        let src_returns = ir
            .block(src_block)
            .map(|d| d.terminator.is_function_exit())
            .unwrap_or(false);
        let snk_is_entry = ir
            .function_for_block(snk_block)
            .and_then(|f| ir.entry_block(f))
            .map(|e| e == snk_block)
            .unwrap_or(false);
        if src_returns && snk_is_entry {
            to_remove.push(eid);
        }
    }
    for eid in to_remove {
        let src = graph.edge(eid).src;
        debug!(edge = eid.0, "removing fake recursive call edge");
        graph.detach_edge(eid);
        graph.renormalize_succs(src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::testutil::{block, call_block, ret_block};
    use crate::ir::{FunctionDef, Module};
    use crate::profile::{load_bytes, write_order1};

    /// main: 0 -> {1, 2} -> 3(ret); block 1 calls f (block 10, ret)
    fn fixture() -> (Graph, NidMap, Module) {
        let module = Module::from_functions(vec![
            FunctionDef {
                name: "main".to_string(),
                blocks: vec![
                    block(0, &[1, 2]),
                    call_block(1, "f", &[3]),
                    block(2, &[3]),
                    ret_block(3),
                ],
            },
            FunctionDef {
                name: "f".to_string(),
                blocks: vec![ret_block(10)],
            },
        ])
        .unwrap();

        let bytes = write_order1(&[
            (0, 1, 6),
            (0, 2, 4),
            (1, 10, 6),
            (10, 3, 6),
            (2, 3, 4),
        ]);
        let raw = load_bytes(&bytes, false).unwrap();
        (raw.graph, raw.nid_map, module)
    }

    #[test]
    fn test_classify_full_pass() {
        let (mut graph, nid_map, module) = fixture();
        let info = BlockInfo::default();
        let terminator = classify(&mut graph, &nid_map, &module, &info).unwrap();

        let block_nodes = BlockNodeMap::build(&nid_map);
        let n0 = block_nodes.nodes_of(BlockId(0))[0];
        let n1 = block_nodes.nodes_of(BlockId(1))[0];
        let n3 = block_nodes.nodes_of(BlockId(3))[0];
        let n10 = block_nodes.nodes_of(BlockId(10))[0];

        // branch at 0 became conditional with weights summing to one
        let succs = graph.succs(n0);
        assert_eq!(succs.len(), 2);
        let sum: f32 = succs.iter().map(|e| graph.edge(*e).weight()).sum();
        assert!((sum - 1.0).abs() < 1e-3);

        // the call edge 1 -> 10 carries a return record
        let call = graph.find_edge_between(n1, n10).unwrap();
        let returns = graph.edge(call).returns().expect("call edge");
        assert_eq!(returns.caller_node, Some(n1));
        assert!(returns.static_exits.contains(&n10));
        assert!(returns.dynamic_exits.contains(&n3));
        assert_eq!(returns.dynamic_rets.len(), 1);

        // the observed exit transition became a return edge
        let ret = graph.find_edge_between(n10, n3).unwrap();
        assert!(graph.edge(ret).is_return());
        match &graph.edge(ret).kind {
            EdgeKind::Return { call: c, .. } => assert_eq!(*c, call),
            _ => unreachable!(),
        }

        // imaginary anchors bracket the program
        assert_eq!(terminator, n3);
        assert!(graph.entry_node().is_some());
        assert!(graph.exit_node().is_some());
    }

    #[test]
    fn test_termination_outside_main_rejected() {
        let module = Module::from_functions(vec![FunctionDef {
            name: "main".to_string(),
            blocks: vec![block(0, &[1]), block(1, &[0])],
        }])
        .unwrap();
        // every node has a successor, so no terminator exists in main
        let bytes = write_order1(&[(0, 1, 5), (1, 0, 5)]);
        let raw = load_bytes(&bytes, false).unwrap();
        let mut graph = raw.graph;
        let err = classify(&mut graph, &raw.nid_map, &module, &BlockInfo::default());
        assert!(matches!(err, Err(IrError::TerminationOutsideMain)));
    }

    #[test]
    fn test_patch_and_fake_recursion_removed() {
        // f is called through a dead trampoline, so the profile enters f
        // at block 10 straight from main's block 0 and shows f's exit 11
        // jumping back to its own entry between the two invocations
        let module = Module::from_functions(vec![
            FunctionDef {
                name: "main".to_string(),
                blocks: vec![block(0, &[1]), ret_block(1)],
            },
            FunctionDef {
                name: "f".to_string(),
                blocks: vec![block(10, &[11]), ret_block(11)],
            },
        ])
        .unwrap();
        let bytes = write_order1(&[
            (0, 10, 2),
            (10, 11, 4),
            (11, 10, 2),
            (11, 1, 2),
        ]);
        let raw = load_bytes(&bytes, false).unwrap();
        let mut graph = raw.graph;
        classify(&mut graph, &raw.nid_map, &module, &BlockInfo::default()).unwrap();

        let block_nodes = BlockNodeMap::build(&raw.nid_map);
        let n10 = block_nodes.nodes_of(BlockId(10))[0];
        let n11 = block_nodes.nodes_of(BlockId(11))[0];

        // the patch pass turned both unexplained entry edges into calls
        let tail_head = graph.find_edge_between(n11, n10).unwrap();
        assert!(graph.edge(tail_head).is_call());

        // the IR-driven call graph knows f is not recursive, so the
        // tail-to-head edge is recognized as fake and dropped
        let cg = DynamicCallGraph::build(&graph, &module, &BlockInfo::default(), &block_nodes);
        remove_fake_recursion(&mut graph, &cg, &module);
        assert!(graph.find_edge_between(n11, n10).is_none());

        let sum: f32 = graph
            .succs(n11)
            .iter()
            .map(|e| graph.edge(*e).weight())
            .sum();
        assert!((sum - 1.0).abs() < 1e-3);
    }
}
