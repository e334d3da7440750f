//! End-to-end structuring pipeline
//!
//! Ties the stages together: profile load, edge classification, shared
//! function inlining, the rewrite fixpoint, task segmentation, and
//! labeling. Invariants are checked between stages so a structural break
//! names the stage that caused it.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::info;

use crate::callgraph::DynamicCallGraph;
use crate::classify::{classify, remove_fake_recursion, BlockNodeMap};
use crate::config::AnalyzerConfig;
use crate::entropy::{snapshot, EntropyInfo};
use crate::graph::{render_dot, Graph};
use crate::inline::virtualize_shared_functions;
use crate::ir::{BlockInfo, IrError, IrProvider};
use crate::profile::RawProfile;
use crate::segment::{find_tasks, Segmentation};
use crate::transforms::{apply_cfg_transforms, checks, kirchhoff};
use crate::warnings;

/// Dump the offending graph next to the invariant failure, then fail
///
/// The DOT artifact is what makes a broken transform debuggable after
/// the fact; the error itself only names the stage.
fn checked(graph: &Graph, step: &str, segmentation: bool) -> Result<()> {
    if let Err(e) = checks::verify(graph, step, segmentation) {
        let artifact = std::env::temp_dir().join("cyclescope_failure.dot");
        if std::fs::write(&artifact, render_dot(graph)).is_ok() {
            tracing::error!(artifact = %artifact.display(), "invariant failure graph dumped");
        }
        return Err(e.into());
    }
    Ok(())
}

/// Everything a structuring run produces
#[derive(Debug)]
pub struct Analysis {
    /// The segmented graph; tasks are its visible cycle nodes
    pub graph: Graph,
    pub segmentation: Segmentation,
    pub entropy: EntropyInfo,
    pub markov_order: u32,
}

/// Run the full structuring pipeline over a loaded profile
pub fn structure_program(
    raw: RawProfile,
    ir: &dyn IrProvider,
    block_info: &BlockInfo,
    config: &AnalyzerConfig,
) -> Result<Analysis> {
    let RawProfile {
        mut graph,
        nid_map,
        markov_order,
        ..
    } = raw;

    classify(&mut graph, &nid_map, ir, block_info).context("edge classification failed")?;
    let block_nodes = BlockNodeMap::build(&nid_map);
    let call_graph = DynamicCallGraph::build(&graph, ir, block_info, &block_nodes);
    remove_fake_recursion(&mut graph, &call_graph, ir);
    checked(&graph, "edge classification", false)?;

    let mut entropy = EntropyInfo {
        start: snapshot(&graph),
        ..EntropyInfo::default()
    };

    let main = ir.main_function().ok_or(IrError::NoMain)?;
    virtualize_shared_functions(&mut graph, &call_graph, main);
    // balance out frequency discrepancies the inlining partition exposed
    kirchhoff::run(&mut graph);
    checked(&graph, "function inlining", false)?;

    apply_cfg_transforms(&mut graph, config, false);
    checked(&graph, "cfg transforms", false)?;
    if let Err(e) = checks::verify_flow(&graph, "cfg transforms") {
        // multi-way joins can stay unbalanced when the profile itself
        // miscounted; that is reportable, not fatal
        warnings::note(&e.to_string());
    }
    entropy.end = snapshot(&graph);

    let segmentation = find_tasks(&mut graph, config);
    checked(&graph, "segmentation", true)?;

    info!(
        tasks = segmentation.kernels.len(),
        order = markov_order,
        "structuring complete"
    );
    Ok(Analysis {
        graph,
        segmentation,
        entropy,
        markov_order,
    })
}

/// Label each task by majority vote over its blocks' label counts
pub fn label_tasks(graph: &mut Graph, seg: &Segmentation, block_info: &BlockInfo) {
    for vn in &seg.kernels {
        let blocks = graph.node(*vn).blocks();
        let mut votes: BTreeMap<String, i64> = BTreeMap::new();
        votes.insert(String::new(), 0);
        for b in blocks {
            match block_info.blocks.get(&b) {
                Some(entry) if !entry.labels.is_empty() => {
                    for (label, count) in &entry.labels {
                        *votes.entry(label.clone()).or_insert(0) += count;
                    }
                }
                _ => {
                    *votes.entry(String::new()).or_insert(0) += 1;
                }
            }
        }
        let winner = votes
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
            .map(|(label, _)| label)
            .unwrap_or_default();
        if let Some(cycle) = graph.node_mut(*vn).as_cycle_mut() {
            cycle.label = winner;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::testutil::{block, ret_block};
    use crate::ir::{BlockEntry, BlockId, FunctionDef, Module};
    use crate::profile::{load_bytes, write_order1};

    fn loop_program() -> (RawProfile, Module) {
        let module = Module::from_functions(vec![FunctionDef {
            name: "main".to_string(),
            blocks: vec![
                block(0, &[1]),
                block(1, &[1, 2]),
                ret_block(2),
            ],
        }])
        .unwrap();
        let bytes = write_order1(&[(0, 1, 1), (1, 1, 499), (1, 2, 1)]);
        (load_bytes(&bytes, false).unwrap(), module)
    }

    #[test]
    fn test_structure_program_end_to_end() {
        let (raw, module) = loop_program();
        let analysis = structure_program(
            raw,
            &module,
            &BlockInfo::default(),
            &AnalyzerConfig::default(),
        )
        .unwrap();

        assert_eq!(analysis.segmentation.kernels.len(), 1);
        let task = analysis.graph.node(analysis.segmentation.kernels[0]);
        assert!(task.blocks().contains(&BlockId(1)));
        // collapsing the loop removed branch uncertainty
        assert!(analysis.entropy.end.total_entropy <= analysis.entropy.start.total_entropy);
    }

    #[test]
    fn test_label_tasks_majority_vote() {
        let (raw, module) = loop_program();
        let mut block_info = BlockInfo::default();
        block_info.blocks.insert(
            BlockId(1),
            BlockEntry {
                block_callers: vec![],
                labels: [("GEMM".to_string(), 12)].into_iter().collect(),
            },
        );
        let mut analysis = structure_program(
            raw,
            &module,
            &block_info,
            &AnalyzerConfig::default(),
        )
        .unwrap();
        label_tasks(
            &mut analysis.graph,
            &analysis.segmentation,
            &block_info,
        );
        let task = analysis
            .graph
            .node(analysis.segmentation.kernels[0])
            .as_cycle()
            .unwrap();
        assert_eq!(task.label, "GEMM");
    }
}
