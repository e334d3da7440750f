// Cyclescope: task-cycle structuring engine
//
// Rebuilds a dynamic control-flow graph from a Markov execution profile,
// collapses control-flow idioms with semantics-preserving rewrites, and
// segments the recurrent structure into task cycles.

#![allow(dead_code)]

pub mod analysis;
pub mod callgraph;
pub mod classify;
pub mod cli;
pub mod config;
pub mod entropy;
pub mod graph;
pub mod hotcode;
pub mod inline;
pub mod ir;
pub mod output;
pub mod profile;
pub mod segment;
pub mod transforms;
pub mod warnings;

pub use analysis::{label_tasks, structure_program, Analysis};
pub use config::AnalyzerConfig;
