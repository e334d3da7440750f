//! Dynamic call graph
//!
//! One node per function observed in the profile, one edge per
//! caller/callee pair carrying the dCFG call edges that realize it. The
//! graph is derived from the IR's call instructions (plus the dynamic
//! callee observations for function pointers), not from the dCFG's call
//! edges: patched edges around profiler blind spots must not count as
//! recursion, or the fake-recursion cleanup could never fire.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::classify::BlockNodeMap;
use crate::graph::{EdgeId, Graph};
use crate::ir::{BlockInfo, FunctionId, IrProvider};

#[derive(Debug, Default)]
pub struct DynamicCallGraph {
    graph: DiGraph<FunctionId, BTreeSet<EdgeId>>,
    index: BTreeMap<FunctionId, NodeIndex>,
}

impl DynamicCallGraph {
    /// Walk the IR's call instructions and collect the observed pairs
    pub fn build(
        graph: &Graph,
        ir: &dyn IrProvider,
        block_info: &BlockInfo,
        block_nodes: &BlockNodeMap,
    ) -> Self {
        let mut cg = DynamicCallGraph::default();
        let live = |f: FunctionId| ir.blocks(f).iter().any(|b| block_nodes.observed(*b));

        for f in ir.functions() {
            if !live(f) {
                continue;
            }
            for b in ir.blocks(f) {
                let def = match ir.block(b) {
                    Some(d) => d,
                    None => continue,
                };
                for inst in &def.instructions {
                    if !inst.is_call() {
                        continue;
                    }
                    let targets: Vec<FunctionId> = match &inst.callee {
                        Some(name) => ir
                            .function_by_name(name)
                            .filter(|t| !ir.is_empty(*t))
                            .into_iter()
                            .collect(),
                        None => block_info
                            .callers_of(b)
                            .iter()
                            .filter_map(|cb| ir.function_for_block(*cb))
                            .collect(),
                    };
                    for t in targets {
                        if !live(t) {
                            continue;
                        }
                        // call sites: visible call edges from this block's
                        // nodes to the callee's entry nodes
                        let mut sites = BTreeSet::new();
                        if let Some(entry) = ir.entry_block(t) {
                            for cn in block_nodes.nodes_of(b) {
                                for en in block_nodes.nodes_of(entry) {
                                    if let Some(e) = graph.find_edge_between(*cn, *en) {
                                        if graph.edge(e).is_call() {
                                            sites.insert(e);
                                        }
                                    }
                                }
                            }
                        }
                        cg.link(f, t, sites);
                    }
                }
            }
        }
        cg
    }

    fn link(&mut self, caller: FunctionId, callee: FunctionId, sites: BTreeSet<EdgeId>) {
        let ci = self.intern(caller);
        let fi = self.intern(callee);
        match self.graph.find_edge(ci, fi) {
            Some(e) => {
                self.graph[e].extend(sites);
            }
            None => {
                self.graph.add_edge(ci, fi, sites);
            }
        }
    }

    fn intern(&mut self, f: FunctionId) -> NodeIndex {
        match self.index.get(&f) {
            Some(i) => *i,
            None => {
                let i = self.graph.add_node(f);
                self.index.insert(f, i);
                i
            }
        }
    }

    pub fn functions(&self) -> Vec<FunctionId> {
        self.index.keys().copied().collect()
    }

    pub fn contains(&self, f: FunctionId) -> bool {
        self.index.contains_key(&f)
    }

    /// A self-edge in the call graph
    pub fn has_direct_recursion(&self, f: FunctionId) -> bool {
        match self.index.get(&f) {
            Some(i) => self.graph.find_edge(*i, *i).is_some(),
            None => false,
        }
    }

    /// Membership in a call-graph cycle of length greater than one
    pub fn has_indirect_recursion(&self, f: FunctionId) -> bool {
        self.recursion_cycle(f).len() > 1
    }

    pub fn is_recursive(&self, f: FunctionId) -> bool {
        self.has_direct_recursion(f) || self.has_indirect_recursion(f)
    }

    /// Functions in the same call-graph strongly connected component
    pub fn recursion_cycle(&self, f: FunctionId) -> BTreeSet<FunctionId> {
        let idx = match self.index.get(&f) {
            Some(i) => *i,
            None => return BTreeSet::new(),
        };
        for component in tarjan_scc(&self.graph) {
            if component.contains(&idx) {
                if component.len() > 1 {
                    return component.iter().map(|i| self.graph[*i]).collect();
                }
                break;
            }
        }
        BTreeSet::new()
    }

    /// Call edges entering a function from outside its recursion unit
    pub fn outside_entrances(&self, f: FunctionId) -> BTreeSet<EdgeId> {
        if !self.index.contains_key(&f) {
            return BTreeSet::new();
        }
        let mut unit = self.recursion_cycle(f);
        unit.insert(f);
        let mut out = BTreeSet::new();
        for member in &unit {
            let mi = self.index[member];
            for e in self.graph.edges_directed(mi, Direction::Incoming) {
                if !unit.contains(&self.graph[e.source()]) {
                    out.extend(e.weight().iter().copied());
                }
            }
        }
        out
    }

    /// Schedule shared-function inlining, children before callers
    ///
    /// Each schedule entry is a set of call-site edges to inline together:
    /// all outside call sites of one function, or of one whole
    /// indirect-recursion unit. Only functions with more than one outside
    /// call site are scheduled. `tarjan_scc` yields components in reverse
    /// topological order, which is exactly callee-before-caller.
    pub fn inline_schedule(&self, main: FunctionId) -> Vec<BTreeSet<EdgeId>> {
        let main_idx = match self.index.get(&main) {
            Some(i) => *i,
            None => return Vec::new(),
        };

        let mut reachable = BTreeSet::new();
        let mut stack = vec![main_idx];
        while let Some(i) = stack.pop() {
            if !reachable.insert(i) {
                continue;
            }
            stack.extend(self.graph.neighbors(i));
        }

        let mut schedule = Vec::new();
        for component in tarjan_scc(&self.graph) {
            if !component.iter().any(|i| reachable.contains(i)) {
                continue;
            }
            // an indirect-recursion unit inlines as one schedule entry
            let representative = self.graph[component[0]];
            let sites = self.outside_entrances(representative);
            if sites.len() > 1 {
                schedule.push(sites);
            }
        }
        schedule
    }
}
