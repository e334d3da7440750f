//! CFG rewrites
//!
//! Five semantics-preserving transforms collapse control-flow idioms into
//! single virtual nodes: trivial chain merges, branch-to-select fans,
//! general bottlenecks, low-frequency loops, and flow balancing. The
//! driver interleaves them in a fixpoint loop that walks the graph
//! breadth-first from the program entrance and stops when a full pass
//! changes nothing.

pub mod bottleneck;
pub mod checks;
pub mod kirchhoff;
pub mod lowfreq;
pub mod select;
pub mod trivial;
pub mod virtualize;

pub use checks::{verify, verify_flow, InvariantError};
pub use virtualize::{
    reverse_full, reverse_to_tasks, revoke_cycle, unwind, virtualize_cycle,
    virtualize_subgraph, Subgraph,
};

use std::collections::{BTreeSet, VecDeque};

use tracing::info;

use crate::config::AnalyzerConfig;
use crate::graph::{Graph, NodeId};

/// One breadth-first rewrite pass; true if anything was virtualized
///
/// Fixed-depth transforms (trivial merge, branch-to-select) always run;
/// the bottleneck search joins when `complex` is set. A successful
/// transform pushes its virtual node back to the front of the queue so
/// chains keep collapsing in one sweep.
fn pass(graph: &mut Graph, config: &AnalyzerConfig, complex: bool) -> bool {
    let mut changed = false;
    let mut covered: BTreeSet<NodeId> = BTreeSet::new();
    let mut queue: VecDeque<NodeId> = VecDeque::new();
    match graph.entry_node() {
        Some(entry) => queue.push_front(entry),
        None => {
            if let Some(first) = graph.node_ids().first() {
                queue.push_front(*first);
            }
        }
    }

    while let Some(front) = queue.pop_front() {
        if !graph.contains_node(front) || covered.contains(&front) {
            covered.insert(front);
            continue;
        }

        let sub = trivial::find(graph, front);
        if !sub.is_empty() {
            covered.extend(sub.nodes.iter().copied());
            let vn = virtualize_subgraph(graph, sub);
            queue.push_front(vn);
            changed = true;
            continue;
        }

        let sub = select::find(graph, front);
        if !sub.is_empty() {
            covered.extend(sub.nodes.iter().copied());
            let vn = virtualize_subgraph(graph, sub);
            queue.push_front(vn);
            changed = true;
            continue;
        }

        if complex {
            if let Some((mut sub, sink)) =
                bottleneck::find(graph, front, config.max_bottleneck_size)
            {
                if bottleneck::validate(graph, &mut sub, front, sink) {
                    covered.extend(sub.nodes.iter().copied());
                    let vn = virtualize_subgraph(graph, sub);
                    queue.push_front(vn);
                    changed = true;
                    continue;
                }
            }
        }

        covered.insert(front);
        for e in graph.succs(front) {
            let snk = graph.edge(e).snk;
            if !covered.contains(&snk) {
                queue.push_back(snk);
            }
        }
    }
    changed
}

/// Run the rewrite fixpoint
///
/// A first sweep applies only the fixed-depth transforms to thin the
/// graph cheaply; the main loop then interleaves all five until a full
/// iteration leaves the graph alone. Segmentation mode is behaviorally
/// identical here; the flag matters to the caller's invariant checks.
pub fn apply_cfg_transforms(graph: &mut Graph, config: &AnalyzerConfig, segmentation: bool) {
    let start_size = graph.size();
    pass(graph, config, false);

    loop {
        let size = graph.size();
        pass(graph, config, true);
        lowfreq::run(graph, config.min_anchor);
        let balanced = kirchhoff::run(graph);
        if !balanced && graph.size() == size {
            break;
        }
    }
    info!(
        segmentation,
        before = start_size,
        after = graph.size(),
        "rewrite fixpoint reached"
    );
}
