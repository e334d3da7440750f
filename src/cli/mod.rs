//! CLI command definitions and dispatch

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::analysis::{label_tasks, structure_program};
use crate::config::AnalyzerConfig;
use crate::graph::render_dot;
use crate::hotcode::{coverage, detect_hot_code, detect_hot_loops};
use crate::ir::{BlockInfo, LoopInfo, Module};
use crate::output::{hot_kernel_file, kernel_file};
use crate::profile::load_path;
use crate::transforms::reverse_to_tasks;

/// Cyclescope - task-cycle structuring for dynamic control-flow graphs
///
/// Reads a Markov execution profile and a lowered IR description,
/// rebuilds the dynamic control-flow graph, collapses control-flow
/// idioms, and reports the task cycles that remain.
#[derive(Parser, Debug)]
#[command(name = "cyclescope")]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Structure a profile into task cycles and write the kernel file
    Structure(StructureArgs),

    /// Detect hot code regions and hot loops (markov order 1 only)
    Hotcode(HotcodeArgs),

    /// Render the dynamic control-flow graph as Graphviz DOT
    Dot(DotArgs),
}

#[derive(Parser, Debug)]
pub struct CommonInputs {
    /// Binary Markov profile
    #[arg(short = 'i', long, env = "CYCLESCOPE_PROFILE")]
    pub profile: PathBuf,

    /// IR module JSON
    #[arg(short = 'b', long, env = "CYCLESCOPE_IR")]
    pub ir: PathBuf,

    /// BlockInfo JSON (dynamic callee targets, labels, thread entrances)
    #[arg(long)]
    pub block_info: Option<PathBuf>,
}

impl CommonInputs {
    pub fn load(&self) -> Result<(Module, BlockInfo)> {
        let module = Module::from_path(&self.ir)
            .with_context(|| format!("loading IR module {}", self.ir.display()))?;
        module.check_supported()?;
        let block_info = match &self.block_info {
            Some(path) => BlockInfo::from_path(path)
                .with_context(|| format!("loading block info {}", path.display()))?,
            None => BlockInfo::default(),
        };
        Ok((module, block_info))
    }
}

#[derive(Parser, Debug)]
pub struct StructureArgs {
    #[command(flatten)]
    pub inputs: CommonInputs,

    /// Output kernel file
    #[arg(short = 'o', long)]
    pub output: PathBuf,

    /// Also render the task-level graph as DOT
    #[arg(short = 'd', long)]
    pub dot: Option<PathBuf>,

    /// Minimum anchor frequency for a cycle to become a task
    #[arg(long, default_value_t = 16)]
    pub min_anchor: u64,

    /// Keep parent tasks with at least this many children
    #[arg(long, default_value_t = 5)]
    pub min_child_kernels: usize,
}

#[derive(Parser, Debug)]
pub struct HotcodeArgs {
    #[command(flatten)]
    pub inputs: CommonInputs,

    /// Output kernel file prefix; writes <prefix>_HotCode.json and,
    /// with loop info, <prefix>_HotLoop.json
    #[arg(short = 'o', long)]
    pub output: PathBuf,

    /// LoopInfo JSON enabling the hot-loop pass
    #[arg(short = 'l', long)]
    pub loop_info: Option<PathBuf>,

    /// Share of runtime the hot set must cover
    #[arg(long, default_value_t = 0.95)]
    pub threshold: f32,
}

#[derive(Parser, Debug)]
pub struct DotArgs {
    #[command(flatten)]
    pub inputs: CommonInputs,

    /// Output DOT file
    #[arg(short = 'o', long)]
    pub output: PathBuf,
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Structure(args) => structure(args),
        Commands::Hotcode(args) => hotcode(args),
        Commands::Dot(args) => dot(args),
    }
}

fn structure(args: StructureArgs) -> Result<()> {
    let (module, block_info) = args.inputs.load()?;
    let raw = load_path(&args.inputs.profile, false)
        .with_context(|| format!("loading profile {}", args.inputs.profile.display()))?;

    let config = AnalyzerConfig {
        min_anchor: args.min_anchor,
        min_child_kernel_exception: args.min_child_kernels,
        ..AnalyzerConfig::default()
    };
    let mut analysis = structure_program(raw, &module, &block_info, &config)?;
    label_tasks(&mut analysis.graph, &analysis.segmentation, &block_info);

    let file = kernel_file(
        &analysis.graph,
        &analysis.segmentation,
        &module,
        &block_info,
        &analysis.entropy,
    );
    std::fs::write(&args.output, format!("{:#}", file))
        .with_context(|| format!("writing {}", args.output.display()))?;
    info!(output = %args.output.display(), "kernel file written");

    if let Some(dot_path) = args.dot {
        let mut view = analysis.graph.clone();
        reverse_to_tasks(&mut view);
        std::fs::write(&dot_path, render_dot(&view))
            .with_context(|| format!("writing {}", dot_path.display()))?;
    }
    Ok(())
}

fn hotcode(args: HotcodeArgs) -> Result<()> {
    let (module, block_info) = args.inputs.load()?;
    let raw = load_path(&args.inputs.profile, true)
        .with_context(|| format!("loading profile {}", args.inputs.profile.display()))?;

    let regions = detect_hot_code(&raw.graph, args.threshold);
    info!(
        coverage = coverage(&raw.graph, &regions),
        "hot code regions detected"
    );
    let stem = args
        .output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "kernels".to_string());
    let file = hot_kernel_file(&regions, &module, &block_info);
    let hot_path = args.output.with_file_name(format!("{stem}_HotCode.json"));
    std::fs::write(&hot_path, format!("{:#}", file))
        .with_context(|| format!("writing {}", hot_path.display()))?;

    if let Some(loop_path) = args.loop_info {
        let loops = LoopInfo::from_path(&loop_path)
            .with_context(|| format!("loading loop info {}", loop_path.display()))?;
        let hot_loops = detect_hot_loops(&regions, &raw.graph, &loops);
        let file = hot_kernel_file(&hot_loops, &module, &block_info);
        let loop_out = args.output.with_file_name(format!("{stem}_HotLoop.json"));
        std::fs::write(&loop_out, format!("{:#}", file))
            .with_context(|| format!("writing {}", loop_out.display()))?;
    }
    Ok(())
}

fn dot(args: DotArgs) -> Result<()> {
    let (module, block_info) = args.inputs.load()?;
    let raw = load_path(&args.inputs.profile, false)
        .with_context(|| format!("loading profile {}", args.inputs.profile.display()))?;

    let mut graph = raw.graph;
    crate::classify::classify(&mut graph, &raw.nid_map, &module, &block_info)?;
    std::fs::write(&args.output, render_dot(&graph))
        .with_context(|| format!("writing {}", args.output.display()))?;
    Ok(())
}

/// Exit codes
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_MALFORMED_INPUT: i32 = 3;
pub const EXIT_INVARIANT: i32 = 4;
pub const EXIT_UNSUPPORTED_IR: i32 = 5;

/// Map a pipeline error to its exit code
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    use crate::ir::IrError;
    use crate::profile::ProfileError;
    use crate::transforms::InvariantError;

    for cause in err.chain() {
        if cause.downcast_ref::<ProfileError>().is_some() {
            return EXIT_MALFORMED_INPUT;
        }
        if let Some(ir_err) = cause.downcast_ref::<IrError>() {
            return match ir_err {
                IrError::UnsupportedTerminator(..) => EXIT_UNSUPPORTED_IR,
                _ => EXIT_MALFORMED_INPUT,
            };
        }
        if cause.downcast_ref::<InvariantError>().is_some() {
            return EXIT_INVARIANT;
        }
    }
    EXIT_ERROR
}
