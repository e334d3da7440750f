//! Flow balancing
//!
//! Profiles over- or under-count across context switches and sampling
//! boundaries, leaving nodes whose inflow and outflow disagree. For any
//! node with a single predecessor and a single successor, the heavier
//! edge is replaced by a virtual edge carrying the lighter frequency,
//! restoring conservation across the node while the source's outgoing
//! probabilities are re-normalized.

use tracing::debug;

use crate::graph::{EdgeKind, Graph};

/// Balance every single-in single-out node; true if anything changed
pub fn run(graph: &mut Graph) -> bool {
    let mut changed = false;
    for n in graph.node_ids() {
        if graph.node(n).is_imaginary() {
            continue;
        }
        let preds = graph.preds(n);
        let succs = graph.succs(n);
        if preds.len() != 1 || succs.len() != 1 {
            continue;
        }
        let (pred, succ) = (preds[0], succs[0]);
        if graph.edge(pred).is_imaginary() || graph.edge(succ).is_imaginary() {
            continue;
        }
        let in_freq = graph.edge(pred).freq();
        let out_freq = graph.edge(succ).freq();
        if in_freq == out_freq {
            continue;
        }
        let heavy = if in_freq > out_freq { pred } else { succ };
        let light_freq = in_freq.min(out_freq);

        let (src, snk, weight) = {
            let e = graph.edge(heavy);
            (e.src, e.snk, e.weight())
        };
        debug!(
            node = n.0,
            heavy = heavy.0,
            from = graph.edge(heavy).freq(),
            to = light_freq,
            "balancing flow"
        );
        graph.detach_edge(heavy);
        graph.add_edge(
            src,
            snk,
            EdgeKind::Virtual {
                freq: light_freq,
                weight,
                underlying: [heavy].into_iter().collect(),
            },
        );
        graph.renormalize_succs(src);
        changed = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testutil::{chain_graph, weigh};
    use crate::transforms::checks::verify_flow;
    use crate::transforms::virtualize::reverse_full;

    #[test]
    fn test_balance_overcounted_edge() {
        // 0 -> 1 carries 10 but 1 -> 2 only 5: the heavier edge drops
        let (mut g, ids) = chain_graph(&[(0, 1, 10), (1, 2, 5)]);
        weigh(&mut g);
        assert!(verify_flow(&g, "pre").is_err());

        assert!(run(&mut g));
        assert!(verify_flow(&g, "post").is_ok());

        let e = g.find_edge_between(ids[&0], ids[&1]).unwrap();
        assert_eq!(g.edge(e).freq(), 5);
        assert!(g.edge(e).is_virtual());
    }

    #[test]
    fn test_balanced_graph_untouched() {
        let (mut g, _ids) = chain_graph(&[(0, 1, 5), (1, 2, 5)]);
        weigh(&mut g);
        assert!(!run(&mut g));
    }

    #[test]
    fn test_reverse_restores_original_frequency() {
        let (mut g, ids) = chain_graph(&[(0, 1, 10), (1, 2, 5)]);
        weigh(&mut g);
        assert!(run(&mut g));
        reverse_full(&mut g);
        let e = g.find_edge_between(ids[&0], ids[&1]).unwrap();
        assert_eq!(g.edge(e).freq(), 10);
        assert!(!g.edge(e).is_virtual());
    }
}
