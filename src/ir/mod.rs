//! IR seam and auxiliary input files
//!
//! The analyzer does not parse compiler IR itself; everything it needs
//! from the program under analysis comes through the [`IrProvider`]
//! trait: functions, their blocks, and enough per-block instruction
//! detail to recover calls and branch fan-out. [`Module`] is the concrete
//! provider used by the CLI, loaded from a JSON lowering of the IR.
//!
//! This module also reads the two auxiliary JSON inputs: block info
//! (observed callee targets, block labels, thread entrances) and loop
//! info (used only by the hot-loop pass).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable basic-block identifier from the IR
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub i64);

/// Handle to a function in the IR module
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FunctionId(pub usize);

#[derive(Debug, Error)]
pub enum IrError {
    #[error("failed to read IR module: {0}")]
    Unreadable(#[from] std::io::Error),
    #[error("failed to parse IR module: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("IR module has no function named `main`")]
    NoMain,
    #[error("block {0:?} appears in more than one function")]
    DuplicateBlock(BlockId),
    #[error("profile references block {0:?} that does not exist in the IR")]
    UnknownBlockId(BlockId),
    #[error("call instruction in block {0:?} names unknown function `{1}`")]
    UnresolvableCallee(BlockId, String),
    #[error("unsupported terminator `{1}` in block {0:?}")]
    UnsupportedTerminator(BlockId, &'static str),
    #[error("program terminated outside `main`; this is not supported")]
    TerminationOutsideMain,
}

/// Block terminator, reduced to what edge classification needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Terminator {
    Branch { targets: Vec<BlockId> },
    Ret,
    Resume,
    Unreachable,
    /// Rejected: computed-goto terminators cannot be classified
    Callbr,
    /// Rejected: GC statepoints are not modeled
    Statepoint,
}

impl Terminator {
    pub fn successors(&self) -> &[BlockId] {
        match self {
            Terminator::Branch { targets } => targets,
            _ => &[],
        }
    }

    /// True for terminators that return control to a caller
    pub fn is_function_exit(&self) -> bool {
        matches!(self, Terminator::Ret | Terminator::Resume)
    }
}

/// One instruction, reduced to call recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: String,
    /// Statically known callee, when the opcode is a call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callee: Option<String>,
}

impl Instruction {
    pub fn is_call(&self) -> bool {
        self.opcode == "call" || self.opcode == "invoke"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDef {
    pub id: BlockId,
    #[serde(default)]
    pub instructions: Vec<Instruction>,
    pub terminator: Terminator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub blocks: Vec<BlockDef>,
}

/// Everything the core needs from the IR
pub trait IrProvider {
    fn functions(&self) -> Vec<FunctionId>;
    fn function_name(&self, f: FunctionId) -> &str;
    fn entry_block(&self, f: FunctionId) -> Option<BlockId>;
    fn blocks(&self, f: FunctionId) -> Vec<BlockId>;
    fn block(&self, b: BlockId) -> Option<&BlockDef>;
    fn function_for_block(&self, b: BlockId) -> Option<FunctionId>;
    fn function_by_name(&self, name: &str) -> Option<FunctionId>;

    /// A function with no blocks is external to the profiled module
    fn is_empty(&self, f: FunctionId) -> bool {
        self.blocks(f).is_empty()
    }

    fn main_function(&self) -> Option<FunctionId> {
        self.function_by_name("main")
    }
}

/// In-memory IR module deserialized from JSON
#[derive(Debug, Clone, Default)]
pub struct Module {
    functions: Vec<FunctionDef>,
    by_name: BTreeMap<String, FunctionId>,
    block_owner: BTreeMap<BlockId, FunctionId>,
    block_index: BTreeMap<BlockId, (usize, usize)>,
}

impl Module {
    pub fn from_functions(functions: Vec<FunctionDef>) -> Result<Self, IrError> {
        let mut module = Module {
            functions,
            ..Default::default()
        };
        for (fi, f) in module.functions.iter().enumerate() {
            module.by_name.insert(f.name.clone(), FunctionId(fi));
            for (bi, b) in f.blocks.iter().enumerate() {
                if module
                    .block_owner
                    .insert(b.id, FunctionId(fi))
                    .is_some()
                {
                    return Err(IrError::DuplicateBlock(b.id));
                }
                module.block_index.insert(b.id, (fi, bi));
            }
        }
        Ok(module)
    }

    pub fn from_path(path: &Path) -> Result<Self, IrError> {
        let raw = std::fs::read_to_string(path)?;
        let functions: Vec<FunctionDef> = serde_json::from_str(&raw)?;
        Module::from_functions(functions)
    }

    /// Reject terminators the classifier cannot handle
    pub fn check_supported(&self) -> Result<(), IrError> {
        for f in &self.functions {
            for b in &f.blocks {
                match b.terminator {
                    Terminator::Callbr => {
                        return Err(IrError::UnsupportedTerminator(b.id, "callbr"))
                    }
                    Terminator::Statepoint => {
                        return Err(IrError::UnsupportedTerminator(b.id, "statepoint"))
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

impl IrProvider for Module {
    fn functions(&self) -> Vec<FunctionId> {
        (0..self.functions.len()).map(FunctionId).collect()
    }

    fn function_name(&self, f: FunctionId) -> &str {
        &self.functions[f.0].name
    }

    fn entry_block(&self, f: FunctionId) -> Option<BlockId> {
        self.functions[f.0].blocks.first().map(|b| b.id)
    }

    fn blocks(&self, f: FunctionId) -> Vec<BlockId> {
        self.functions[f.0].blocks.iter().map(|b| b.id).collect()
    }

    fn block(&self, b: BlockId) -> Option<&BlockDef> {
        self.block_index
            .get(&b)
            .map(|(fi, bi)| &self.functions[*fi].blocks[*bi])
    }

    fn function_for_block(&self, b: BlockId) -> Option<FunctionId> {
        self.block_owner.get(&b).copied()
    }

    fn function_by_name(&self, name: &str) -> Option<FunctionId> {
        self.by_name.get(name).copied()
    }
}

// ----------------------------------------------------------------------
// Auxiliary inputs
// ----------------------------------------------------------------------

/// Per-block dynamic observations from the profiler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockEntry {
    /// Blocks observed to follow this block through an indirect call
    #[serde(rename = "BlockCallers", default)]
    pub block_callers: Vec<BlockId>,
    /// Semantic label votes attached to this block
    #[serde(rename = "Labels", default)]
    pub labels: BTreeMap<String, i64>,
}

/// Parsed BlockInfo.json
#[derive(Debug, Clone, Default)]
pub struct BlockInfo {
    pub blocks: BTreeMap<BlockId, BlockEntry>,
    pub thread_entrances: BTreeSet<BlockId>,
}

impl BlockInfo {
    pub fn from_path(path: &Path) -> Result<Self, IrError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_str(&raw)
    }

    pub fn from_str(raw: &str) -> Result<Self, IrError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let mut info = BlockInfo::default();
        if let Some(map) = value.as_object() {
            for (key, entry) in map {
                if key == "ThreadEntrances" {
                    let ids: Vec<i64> = serde_json::from_value(entry.clone())?;
                    info.thread_entrances = ids.into_iter().map(BlockId).collect();
                } else if let Ok(id) = key.parse::<i64>() {
                    let parsed: BlockEntry = serde_json::from_value(entry.clone())?;
                    info.blocks.insert(BlockId(id), parsed);
                }
            }
        }
        Ok(info)
    }

    pub fn callers_of(&self, b: BlockId) -> &[BlockId] {
        self.blocks
            .get(&b)
            .map(|e| e.block_callers.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopEntry {
    pub id: i64,
    #[serde(rename = "Blocks")]
    pub blocks: Vec<BlockId>,
    #[serde(rename = "Type")]
    pub loop_type: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopInfo {
    #[serde(rename = "Loops", default)]
    pub loops: Vec<LoopEntry>,
}

impl LoopInfo {
    pub fn from_path(path: &Path) -> Result<Self, IrError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}
