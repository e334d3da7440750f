//! DOT rendering of the dynamic control-flow graph

use std::fmt::Write;

use super::{EdgeKind, Graph, NodeKind};

fn node_label(graph: &Graph, id: super::NodeId) -> String {
    let node = graph.node(id);
    match &node.kind {
        NodeKind::Imaginary => "VOID".to_string(),
        NodeKind::Control(c) => {
            let history: Vec<String> =
                c.original_blocks.iter().map(|b| b.0.to_string()).collect();
            format!("{}\\n[{}]", id.0, history.join(","))
        }
        NodeKind::Virtual(v) => format!("{}\\nvirtual({})", id.0, v.subgraph.len()),
        NodeKind::Cycle(c) => {
            if c.label.is_empty() {
                format!("{}\\ntask {}", id.0, c.kid.0)
            } else {
                format!("{}\\ntask {} ({})", id.0, c.kid.0, c.label)
            }
        }
    }
}

/// Render the visible graph as Graphviz DOT
///
/// Call and return edges are dashed, conditional edges dotted with their
/// branch probability, imaginary nodes labeled `VOID`.
pub fn render_dot(graph: &Graph) -> String {
    let mut dot = String::from("digraph dcfg {\n");
    dot.push_str("  rankdir=TB;\n");
    dot.push_str("  node [shape=box, style=rounded];\n\n");

    for id in graph.node_ids() {
        let shape = if graph.node(id).is_cycle() {
            " peripheries=2"
        } else {
            ""
        };
        writeln!(
            dot,
            "  \"{}\" [label=\"{}\"{}];",
            id.0,
            node_label(graph, id),
            shape
        )
        .ok();
    }

    dot.push('\n');
    for id in graph.edge_ids() {
        let edge = graph.edge(id);
        let (style, label) = match &edge.kind {
            EdgeKind::Unconditional { .. } => ("solid", String::new()),
            EdgeKind::Conditional { weight, .. } => ("dotted", format!("{:.3}", weight)),
            EdgeKind::Call { .. } => ("dashed", "call".to_string()),
            EdgeKind::Return { .. } => ("dashed", "ret".to_string()),
            EdgeKind::Imaginary => ("bold", String::new()),
            EdgeKind::Virtual { weight, .. } => ("dotted", format!("v {:.3}", weight)),
        };
        let label_attr = if label.is_empty() {
            String::new()
        } else {
            format!(", label=\"{}\"", label)
        };
        writeln!(
            dot,
            "  \"{}\" -> \"{}\" [style={}{}];",
            edge.src.0, edge.snk.0, style, label_attr
        )
        .ok();
    }

    dot.push_str("}\n");
    dot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testutil::{chain_graph, weigh};
    use crate::graph::EdgeKind;

    #[test]
    fn test_render_dot_structure() {
        let (mut g, ids) = chain_graph(&[(0, 1, 9), (0, 2, 1)]);
        weigh(&mut g);
        let entry = g.add_imaginary_node();
        g.add_edge(entry, ids[&0], EdgeKind::Imaginary);

        let dot = render_dot(&g);
        assert!(dot.starts_with("digraph dcfg {"));
        assert!(dot.ends_with("}\n"));
        assert!(dot.contains("VOID"));
        assert!(dot.contains("style=dotted"));
        assert!(dot.contains("style=bold"));
    }
}
