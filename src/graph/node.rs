//! Node model for the dynamic control-flow graph
//!
//! Nodes form a tagged sum: profile-observed `Control` nodes, synthetic
//! `Imaginary` anchors for program entry/exit, `Virtual` nodes produced by
//! the rewrite transforms, and `Cycle` nodes (discovered tasks). Virtual
//! and cycle nodes own the subgraph they replaced; the interior stays in
//! the graph arena so reverse transforms can re-expose it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::edge::EdgeId;
use crate::ir::BlockId;

/// Stable node identifier, assigned sequentially and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// Stable task identifier for discovered cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u32);

/// A node in the dynamic control-flow graph
///
/// Adjacency is stored on the node as edge-ID sets. The sets survive
/// virtualization: a hidden interior node keeps its original adjacency,
/// which is what the reverse transform uses to re-anchor boundary edges.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub preds: BTreeSet<EdgeId>,
    pub succs: BTreeSet<EdgeId>,
    pub kind: NodeKind,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    /// One node per distinct block-history tuple observed in the profile
    Control(ControlData),
    /// Synthetic source/sink anchoring program entry and exit
    Imaginary,
    /// A collapsed subgraph produced by a CFG transform
    Virtual(VirtualData),
    /// A validated task cycle (virtual node with task identity)
    Cycle(CycleData),
}

#[derive(Debug, Clone, Default)]
pub struct ControlData {
    /// Block history in profile order, oldest to newest
    pub original_blocks: Vec<BlockId>,
    /// Deduplicated set of the history blocks
    pub blocks: BTreeSet<BlockId>,
}

#[derive(Debug, Clone, Default)]
pub struct VirtualData {
    /// Interior nodes, removed from the visible graph but alive in the arena
    pub subgraph: BTreeSet<NodeId>,
    /// Interior edges (both endpoints in `subgraph`)
    pub sub_edges: BTreeSet<EdgeId>,
    /// Union of the interior nodes' blocks
    pub blocks: BTreeSet<BlockId>,
    /// Maximum incoming frequency over the interior nodes
    pub anchor: u64,
}

#[derive(Debug, Clone)]
pub struct CycleData {
    pub virt: VirtualData,
    pub kid: TaskId,
    pub label: String,
    pub children: BTreeSet<TaskId>,
    pub parents: BTreeSet<TaskId>,
}

impl Node {
    pub(super) fn new(id: NodeId, kind: NodeKind) -> Self {
        Node {
            id,
            preds: BTreeSet::new(),
            succs: BTreeSet::new(),
            kind,
        }
    }

    pub fn is_imaginary(&self) -> bool {
        matches!(self.kind, NodeKind::Imaginary)
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.kind, NodeKind::Virtual(_) | NodeKind::Cycle(_))
    }

    pub fn is_cycle(&self) -> bool {
        matches!(self.kind, NodeKind::Cycle(_))
    }

    /// Virtual payload shared by `Virtual` and `Cycle` nodes
    pub fn virtual_data(&self) -> Option<&VirtualData> {
        match &self.kind {
            NodeKind::Virtual(v) => Some(v),
            NodeKind::Cycle(c) => Some(&c.virt),
            _ => None,
        }
    }

    pub fn virtual_data_mut(&mut self) -> Option<&mut VirtualData> {
        match &mut self.kind {
            NodeKind::Virtual(v) => Some(v),
            NodeKind::Cycle(c) => Some(&mut c.virt),
            _ => None,
        }
    }

    pub fn as_cycle(&self) -> Option<&CycleData> {
        match &self.kind {
            NodeKind::Cycle(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_cycle_mut(&mut self) -> Option<&mut CycleData> {
        match &mut self.kind {
            NodeKind::Cycle(c) => Some(c),
            _ => None,
        }
    }

    /// Basic blocks represented by this node, through any virtual layers
    pub fn blocks(&self) -> BTreeSet<BlockId> {
        match &self.kind {
            NodeKind::Control(c) => c.blocks.clone(),
            NodeKind::Imaginary => BTreeSet::new(),
            NodeKind::Virtual(v) => v.blocks.clone(),
            NodeKind::Cycle(c) => c.virt.blocks.clone(),
        }
    }

    /// Newest block of the history tuple, if this is a control node
    pub fn newest_block(&self) -> Option<BlockId> {
        match &self.kind {
            NodeKind::Control(c) => c.original_blocks.last().copied(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_data_covers_cycles() {
        let control = Node::new(NodeId(0), NodeKind::Control(ControlData::default()));
        assert!(control.virtual_data().is_none());

        let vn = Node::new(NodeId(1), NodeKind::Virtual(VirtualData::default()));
        assert!(vn.virtual_data().is_some());
        assert!(!vn.is_cycle());

        let cycle = Node::new(
            NodeId(2),
            NodeKind::Cycle(CycleData {
                virt: VirtualData::default(),
                kid: TaskId(0),
                label: String::new(),
                children: BTreeSet::new(),
                parents: BTreeSet::new(),
            }),
        );
        assert!(cycle.virtual_data().is_some());
        assert!(cycle.is_cycle() && cycle.is_virtual());
    }

    #[test]
    fn test_newest_block() {
        let node = Node::new(
            NodeId(0),
            NodeKind::Control(ControlData {
                original_blocks: vec![BlockId(3), BlockId(7)],
                blocks: [BlockId(3), BlockId(7)].into_iter().collect(),
            }),
        );
        assert_eq!(node.newest_block(), Some(BlockId(7)));
    }
}
