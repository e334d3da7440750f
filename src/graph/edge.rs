//! Edge model for the dynamic control-flow graph
//!
//! Edges are a tagged sum over the transition kinds the classifier can
//! recover from the profile and the IR: plain unconditional transitions,
//! weighted conditional branches, call/return pairs, imaginary boundary
//! edges, and virtual edges covering collapsed subgraphs. Call and return
//! edges reference each other through `EdgeId` handles only, so the arena
//! never holds ownership cycles.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::node::NodeId;
use crate::ir::FunctionId;

/// Stable edge identifier, assigned sequentially and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeId(pub u64);

/// Return-edge bookkeeping attached to every call edge
///
/// The profile never records the implicit return jump of a call, so the
/// classifier reconstructs it: `static_rets` are synthetic exit-to-caller
/// edges that do not exist in the raw graph, `dynamic_rets` are the real
/// profile edges from a callee exit to a caller successor.
#[derive(Debug, Clone, Default)]
pub struct Returns {
    /// Caller's node (its blocks contain the call instruction)
    pub caller_node: Option<NodeId>,
    /// IR function being called
    pub function: Option<FunctionId>,
    /// Nodes of the static function plus transitively called children
    pub function_nodes: BTreeSet<NodeId>,
    /// Nodes containing return/resume terminators
    pub static_exits: BTreeSet<NodeId>,
    /// Synthetic edges static_exit -> caller_node
    pub static_rets: BTreeSet<EdgeId>,
    /// Observed successors-of-caller
    pub dynamic_exits: BTreeSet<NodeId>,
    /// Real profile edges static_exit -> dynamic_exit
    pub dynamic_rets: BTreeSet<EdgeId>,
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub id: EdgeId,
    pub src: NodeId,
    pub snk: NodeId,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone)]
pub enum EdgeKind {
    Unconditional {
        freq: u64,
    },
    /// Edge whose source had two or more observed successors; `weight` is
    /// the branch probability freq / sum-of-sibling-freqs
    Conditional {
        freq: u64,
        weight: f32,
    },
    Call {
        freq: u64,
        weight: f32,
        returns: Returns,
    },
    Return {
        freq: u64,
        weight: f32,
        /// The call edge this return closes
        call: EdgeId,
    },
    /// Unweighted boundary edge touching an imaginary node
    Imaginary,
    /// Covers a set of edges collapsed by a transform
    Virtual {
        freq: u64,
        weight: f32,
        underlying: BTreeSet<EdgeId>,
    },
}

impl Edge {
    pub(super) fn new(id: EdgeId, src: NodeId, snk: NodeId, kind: EdgeKind) -> Self {
        Edge { id, src, snk, kind }
    }

    pub fn freq(&self) -> u64 {
        match &self.kind {
            EdgeKind::Unconditional { freq }
            | EdgeKind::Conditional { freq, .. }
            | EdgeKind::Call { freq, .. }
            | EdgeKind::Return { freq, .. }
            | EdgeKind::Virtual { freq, .. } => *freq,
            EdgeKind::Imaginary => 0,
        }
    }

    /// Branch probability of taking this edge from its source
    ///
    /// Unconditional and imaginary edges are certain.
    pub fn weight(&self) -> f32 {
        match &self.kind {
            EdgeKind::Conditional { weight, .. }
            | EdgeKind::Call { weight, .. }
            | EdgeKind::Return { weight, .. }
            | EdgeKind::Virtual { weight, .. } => *weight,
            EdgeKind::Unconditional { .. } | EdgeKind::Imaginary => 1.0,
        }
    }

    /// Recompute the branch probability against a new sibling total
    pub fn set_weight_from_total(&mut self, total: u64) {
        let freq = self.freq();
        let w = if total == 0 {
            0.0
        } else {
            freq as f32 / total as f32
        };
        match &mut self.kind {
            EdgeKind::Conditional { weight, .. }
            | EdgeKind::Call { weight, .. }
            | EdgeKind::Return { weight, .. }
            | EdgeKind::Virtual { weight, .. } => *weight = w,
            EdgeKind::Unconditional { .. } | EdgeKind::Imaginary => {}
        }
    }

    pub fn set_weight(&mut self, w: f32) {
        match &mut self.kind {
            EdgeKind::Conditional { weight, .. }
            | EdgeKind::Call { weight, .. }
            | EdgeKind::Return { weight, .. }
            | EdgeKind::Virtual { weight, .. } => *weight = w,
            EdgeKind::Unconditional { .. } | EdgeKind::Imaginary => {}
        }
    }

    pub fn is_imaginary(&self) -> bool {
        matches!(self.kind, EdgeKind::Imaginary)
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.kind, EdgeKind::Virtual { .. })
    }

    pub fn is_call(&self) -> bool {
        matches!(self.kind, EdgeKind::Call { .. })
    }

    pub fn is_return(&self) -> bool {
        matches!(self.kind, EdgeKind::Return { .. })
    }

    /// Carries a branch probability that participates in sum-to-one checks
    pub fn is_weighted(&self) -> bool {
        !matches!(
            self.kind,
            EdgeKind::Unconditional { .. } | EdgeKind::Imaginary
        )
    }

    pub fn returns(&self) -> Option<&Returns> {
        match &self.kind {
            EdgeKind::Call { returns, .. } => Some(returns),
            _ => None,
        }
    }

    pub fn returns_mut(&mut self) -> Option<&mut Returns> {
        match &mut self.kind {
            EdgeKind::Call { returns, .. } => Some(returns),
            _ => None,
        }
    }

    pub fn underlying(&self) -> Option<&BTreeSet<EdgeId>> {
        match &self.kind {
            EdgeKind::Virtual { underlying, .. } => Some(underlying),
            _ => None,
        }
    }
}
