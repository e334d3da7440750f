//! Arena-backed graph container for the dynamic control-flow graph
//!
//! The graph owns two arenas keyed by stable IDs plus visible index sets.
//! Transforms hide subgraphs by removing them from the visible sets while
//! the arena keeps every node and edge ever created; reverse transforms
//! re-admit them. All iteration is in ID order, which pins down the
//! fixpoint loops and makes runs reproducible.

pub mod dijkstra;
pub mod dot;
pub mod edge;
pub mod node;

pub use dijkstra::{find_cycle, has_cycle};
pub use dot::render_dot;
pub use edge::{Edge, EdgeId, EdgeKind, Returns};
pub use node::{ControlData, CycleData, Node, NodeId, NodeKind, TaskId, VirtualData};

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::BlockId;

#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeMap<EdgeId, Edge>,
    visible_nodes: BTreeSet<NodeId>,
    visible_edges: BTreeSet<EdgeId>,
    next_node: u64,
    next_edge: u64,
    next_task: u32,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    // ------------------------------------------------------------------
    // Node management
    // ------------------------------------------------------------------

    fn insert_node(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        self.nodes.insert(id, Node::new(id, kind));
        self.visible_nodes.insert(id);
        id
    }

    pub fn add_control_node(&mut self, original_blocks: Vec<BlockId>) -> NodeId {
        let blocks = original_blocks.iter().copied().collect();
        self.insert_node(NodeKind::Control(ControlData {
            original_blocks,
            blocks,
        }))
    }

    pub fn add_imaginary_node(&mut self) -> NodeId {
        self.insert_node(NodeKind::Imaginary)
    }

    pub fn add_virtual_node(&mut self, data: VirtualData) -> NodeId {
        self.insert_node(NodeKind::Virtual(data))
    }

    pub fn add_cycle_node(&mut self, virt: VirtualData) -> NodeId {
        let kid = TaskId(self.next_task);
        self.next_task += 1;
        self.insert_node(NodeKind::Cycle(CycleData {
            virt,
            kid,
            label: String::new(),
            children: BTreeSet::new(),
            parents: BTreeSet::new(),
        }))
    }

    /// Hide a node from the visible graph; the arena keeps it
    pub fn hide_node(&mut self, id: NodeId) {
        self.visible_nodes.remove(&id);
    }

    /// Re-admit a hidden node
    pub fn show_node(&mut self, id: NodeId) {
        debug_assert!(self.nodes.contains_key(&id));
        self.visible_nodes.insert(id);
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[&id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes.get_mut(&id).expect("node missing from arena")
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.visible_nodes.contains(&id)
    }

    pub fn node_count(&self) -> usize {
        self.visible_nodes.len()
    }

    /// Visible node IDs in ascending ID order
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.visible_nodes.iter().copied().collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.visible_nodes.iter().map(|id| &self.nodes[id])
    }

    // ------------------------------------------------------------------
    // Edge management
    // ------------------------------------------------------------------

    /// Create an edge and wire it into both endpoints' adjacency
    pub fn add_edge(&mut self, src: NodeId, snk: NodeId, kind: EdgeKind) -> EdgeId {
        let id = EdgeId(self.next_edge);
        self.next_edge += 1;
        self.edges.insert(id, Edge::new(id, src, snk, kind));
        self.visible_edges.insert(id);
        self.node_mut(src).succs.insert(id);
        self.node_mut(snk).preds.insert(id);
        id
    }

    /// Create an edge in the arena only: not visible, no adjacency.
    /// The classifier records synthetic static return edges this way.
    pub fn add_detached_edge(&mut self, src: NodeId, snk: NodeId, kind: EdgeKind) -> EdgeId {
        let id = EdgeId(self.next_edge);
        self.next_edge += 1;
        self.edges.insert(id, Edge::new(id, src, snk, kind));
        id
    }

    /// Remove an edge from the visible graph and from both endpoints'
    /// adjacency; the arena keeps it
    pub fn detach_edge(&mut self, id: EdgeId) {
        self.visible_edges.remove(&id);
        let (src, snk) = {
            let e = &self.edges[&id];
            (e.src, e.snk)
        };
        if let Some(n) = self.nodes.get_mut(&src) {
            n.succs.remove(&id);
        }
        if let Some(n) = self.nodes.get_mut(&snk) {
            n.preds.remove(&id);
        }
    }

    /// Hide an edge from the visible set only, leaving adjacency intact.
    /// Interior edges of a virtualized subgraph are hidden this way so the
    /// hidden interior keeps a consistent shape for the reverse transform.
    pub fn hide_edge(&mut self, id: EdgeId) {
        self.visible_edges.remove(&id);
    }

    /// Re-admit a hidden edge
    pub fn show_edge(&mut self, id: EdgeId) {
        debug_assert!(self.edges.contains_key(&id));
        self.visible_edges.insert(id);
    }

    /// Insert an edge into both endpoints' adjacency sets
    pub fn wire_edge(&mut self, id: EdgeId) {
        let (src, snk) = {
            let e = &self.edges[&id];
            (e.src, e.snk)
        };
        self.node_mut(src).succs.insert(id);
        self.node_mut(snk).preds.insert(id);
    }

    /// Drop an edge from one node's successor set only
    pub fn remove_successor(&mut self, n: NodeId, e: EdgeId) {
        self.node_mut(n).succs.remove(&e);
    }

    /// Drop an edge from one node's predecessor set only
    pub fn remove_predecessor(&mut self, n: NodeId, e: EdgeId) {
        self.node_mut(n).preds.remove(&e);
    }

    /// Point an edge at a new sink, leaving the old sink's adjacency
    /// untouched so the reverse transform can find the original owner
    pub fn retarget_snk(&mut self, id: EdgeId, new_snk: NodeId) {
        self.edge_mut(id).snk = new_snk;
        self.node_mut(new_snk).preds.insert(id);
    }

    /// Point an edge at a new source, mirror of [`Graph::retarget_snk`]
    pub fn retarget_src(&mut self, id: EdgeId, new_src: NodeId) {
        self.edge_mut(id).src = new_src;
        self.node_mut(new_src).succs.insert(id);
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[&id]
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
        self.edges.get_mut(&id).expect("edge missing from arena")
    }

    pub fn contains_edge(&self, id: EdgeId) -> bool {
        self.visible_edges.contains(&id)
    }

    pub fn edge_count(&self) -> usize {
        self.visible_edges.len()
    }

    pub fn edge_ids(&self) -> Vec<EdgeId> {
        self.visible_edges.iter().copied().collect()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.visible_edges.iter().map(|id| &self.edges[id])
    }

    /// Nodes plus edges, the size measure the fixpoint loops watch
    pub fn size(&self) -> usize {
        self.visible_nodes.len() + self.visible_edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visible_nodes.is_empty()
    }

    // ------------------------------------------------------------------
    // Adjacency queries (visible view)
    // ------------------------------------------------------------------

    /// Visible predecessor edges of a node, in edge-ID order
    pub fn preds(&self, id: NodeId) -> Vec<EdgeId> {
        self.nodes[&id]
            .preds
            .iter()
            .copied()
            .filter(|e| self.visible_edges.contains(e))
            .collect()
    }

    /// Visible successor edges of a node, in edge-ID order
    pub fn succs(&self, id: NodeId) -> Vec<EdgeId> {
        self.nodes[&id]
            .succs
            .iter()
            .copied()
            .filter(|e| self.visible_edges.contains(e))
            .collect()
    }

    /// True if an edge src -> snk exists in the visible graph
    pub fn find_edge_between(&self, src: NodeId, snk: NodeId) -> Option<EdgeId> {
        self.nodes[&src]
            .succs
            .iter()
            .copied()
            .filter(|e| self.visible_edges.contains(e))
            .find(|e| self.edges[e].snk == snk)
    }

    /// Total outgoing frequency of a node's visible successors
    pub fn outgoing_freq(&self, id: NodeId) -> u64 {
        self.succs(id)
            .iter()
            .map(|e| self.edges[e].freq())
            .sum()
    }

    /// Total incoming frequency of a node, over the arena adjacency
    ///
    /// Used for anchor computation, where hidden boundary edges of a
    /// just-virtualized interior still count toward the node's heat.
    pub fn incoming_freq_all(&self, id: NodeId) -> u64 {
        self.nodes[&id]
            .preds
            .iter()
            .map(|e| self.edges[e].freq())
            .sum()
    }

    /// Re-normalize the branch probabilities of a node's visible successors
    pub fn renormalize_succs(&mut self, id: NodeId) {
        let succs = self.succs(id);
        let total: u64 = succs.iter().map(|e| self.edges[e].freq()).sum();
        for e in succs {
            self.edge_mut(e).set_weight_from_total(total);
        }
    }

    // ------------------------------------------------------------------
    // Boundary classification
    // ------------------------------------------------------------------

    /// Program entry anchor: the visible imaginary node with no predecessors
    pub fn entry_node(&self) -> Option<NodeId> {
        self.nodes()
            .find(|n| n.is_imaginary() && self.preds(n.id).is_empty())
            .map(|n| n.id)
    }

    /// Program exit anchor: the visible imaginary node with no successors
    pub fn exit_node(&self) -> Option<NodeId> {
        self.nodes()
            .find(|n| n.is_imaginary() && self.succs(n.id).is_empty())
            .map(|n| n.id)
    }

    /// Max incoming frequency over a set of nodes, via arena adjacency
    pub fn anchor_of(&self, nodes: &BTreeSet<NodeId>) -> u64 {
        nodes
            .iter()
            .map(|n| self.incoming_freq_all(*n))
            .max()
            .unwrap_or(0)
    }

    /// True if a cycle node lies strictly beneath this node's virtual layers
    pub fn covers_cycle(&self, id: NodeId) -> bool {
        let data = match self.node(id).virtual_data() {
            Some(d) => d,
            None => return false,
        };
        let mut queue: Vec<NodeId> = data.subgraph.iter().copied().collect();
        while let Some(n) = queue.pop() {
            let node = &self.nodes[&n];
            if node.is_cycle() {
                return true;
            }
            if let Some(v) = node.virtual_data() {
                queue.extend(v.subgraph.iter().copied());
            }
        }
        false
    }

    /// True if `target` lies beneath `cover`'s virtual layers
    pub fn covers_node(&self, cover: NodeId, target: NodeId) -> bool {
        let data = match self.node(cover).virtual_data() {
            Some(d) => d,
            None => return false,
        };
        let mut queue: Vec<NodeId> = data.subgraph.iter().copied().collect();
        while let Some(n) = queue.pop() {
            if n == target {
                return true;
            }
            if let Some(v) = self.nodes[&n].virtual_data() {
                queue.extend(v.subgraph.iter().copied());
            }
        }
        false
    }
}
