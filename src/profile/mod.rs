//! Binary Markov profile loader
//!
//! The profile is a little-endian stream: a `(k, block_count, edge_count)`
//! header followed by `edge_count` records of `history[k], snk, freq`.
//! Each distinct length-k history vector becomes one control node; each
//! record becomes one unconditional edge. The sink node's history is the
//! source history slid forward by the sink block.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use thiserror::Error;
use tracing::info;

use crate::graph::{EdgeKind, Graph, NodeId};
use crate::ir::BlockId;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to read profile: {0}")]
    Unreadable(#[from] std::io::Error),
    #[error("malformed profile header at offset {0}")]
    MalformedHeader(usize),
    #[error("truncated record {record} at offset {offset}")]
    TruncatedRecord { record: u32, offset: usize },
    #[error("duplicate edge {src:?} -> {snk:?} in record {record}")]
    DuplicateEdge {
        record: u32,
        src: Vec<BlockId>,
        snk: BlockId,
    },
    #[error("hot code detection requires a markov order 1 profile, got order {0}")]
    HotCodeRequiresOrder1(u32),
}

/// Maps each node to the block-history tuple it represents
pub type NidMap = BTreeMap<Vec<BlockId>, NodeId>;

/// The raw graph read from a profile, before edge classification
#[derive(Debug)]
pub struct RawProfile {
    pub graph: Graph,
    pub nid_map: NidMap,
    pub markov_order: u32,
    pub block_count: u32,
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.data.get(self.offset..self.offset + n)?;
        self.offset += n;
        Some(slice)
    }

    fn read_u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Option<u64> {
        self.take(8).map(|b| u64::from_le_bytes(b.try_into().unwrap()))
    }
}

/// Load a profile from raw bytes
///
/// `hot_code` enforces the markov-order-1 restriction the hot-code pass
/// depends on.
pub fn load_bytes(data: &[u8], hot_code: bool) -> Result<RawProfile, ProfileError> {
    let mut cur = Cursor { data, offset: 0 };

    let markov_order = cur
        .read_u32()
        .filter(|k| *k >= 1)
        .ok_or(ProfileError::MalformedHeader(0))?;
    let block_count = cur.read_u32().ok_or(ProfileError::MalformedHeader(4))?;
    let edge_count = cur.read_u32().ok_or(ProfileError::MalformedHeader(8))?;

    if hot_code && markov_order != 1 {
        return Err(ProfileError::HotCodeRequiresOrder1(markov_order));
    }

    let mut graph = Graph::new();
    let mut nid_map: NidMap = BTreeMap::new();

    for record in 0..edge_count {
        let record_offset = cur.offset;
        let mut history = Vec::with_capacity(markov_order as usize);
        for _ in 0..markov_order {
            let id = cur.read_u32().ok_or(ProfileError::TruncatedRecord {
                record,
                offset: record_offset,
            })?;
            history.push(BlockId(id as i64));
        }
        let snk = cur.read_u32().ok_or(ProfileError::TruncatedRecord {
            record,
            offset: record_offset,
        })?;
        let freq = cur.read_u64().ok_or(ProfileError::TruncatedRecord {
            record,
            offset: record_offset,
        })?;

        let src_node = match nid_map.get(&history) {
            Some(id) => *id,
            None => {
                let id = graph.add_control_node(history.clone());
                nid_map.insert(history.clone(), id);
                id
            }
        };

        // slide the history window: drop the oldest block, append the sink
        let mut snk_history: Vec<BlockId> = history[1..].to_vec();
        snk_history.push(BlockId(snk as i64));
        let snk_node = match nid_map.get(&snk_history) {
            Some(id) => *id,
            None => {
                let id = graph.add_control_node(snk_history.clone());
                nid_map.insert(snk_history.clone(), id);
                id
            }
        };

        if graph.find_edge_between(src_node, snk_node).is_some() {
            return Err(ProfileError::DuplicateEdge {
                record,
                src: history,
                snk: BlockId(snk as i64),
            });
        }
        graph.add_edge(src_node, snk_node, EdgeKind::Unconditional { freq });
    }

    info!(
        order = markov_order,
        nodes = graph.node_count(),
        edges = graph.edge_count(),
        "profile loaded"
    );

    Ok(RawProfile {
        graph,
        nid_map,
        markov_order,
        block_count,
    })
}

pub fn load_path(path: &Path, hot_code: bool) -> Result<RawProfile, ProfileError> {
    let mut data = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut data)?;
    load_bytes(&data, hot_code)
}

/// Serialize edges into the binary profile format, k = 1
///
/// The inverse of [`load_bytes`] for order-1 profiles; test fixtures and
/// the repro tooling build their inputs with it.
pub fn write_order1(edges: &[(i64, i64, u64)]) -> Vec<u8> {
    let blocks: std::collections::BTreeSet<i64> = edges
        .iter()
        .flat_map(|(s, t, _)| [*s, *t])
        .collect();
    let mut out = Vec::new();
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&(blocks.len() as u32).to_le_bytes());
    out.extend_from_slice(&(edges.len() as u32).to_le_bytes());
    for (src, snk, freq) in edges {
        out.extend_from_slice(&(*src as u32).to_le_bytes());
        out.extend_from_slice(&(*snk as u32).to_le_bytes());
        out.extend_from_slice(&freq.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_order1() {
        let bytes = write_order1(&[(0, 1, 10), (1, 0, 9), (1, 2, 1)]);
        let raw = load_bytes(&bytes, false).unwrap();
        assert_eq!(raw.markov_order, 1);
        assert_eq!(raw.graph.node_count(), 3);
        assert_eq!(raw.graph.edge_count(), 3);

        let n1 = raw.nid_map[&vec![BlockId(1)]];
        assert_eq!(raw.graph.succs(n1).len(), 2);
    }

    #[test]
    fn test_load_order2_slides_history() {
        // k=2 record: history (0,1), sink 2 -> sink node history (1,2)
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&7u64.to_le_bytes());

        let raw = load_bytes(&bytes, false).unwrap();
        assert_eq!(raw.graph.node_count(), 2);
        assert!(raw
            .nid_map
            .contains_key(&vec![BlockId(0), BlockId(1)]));
        assert!(raw
            .nid_map
            .contains_key(&vec![BlockId(1), BlockId(2)]));
    }

    #[test]
    fn test_malformed_header() {
        let err = load_bytes(&[1, 0, 0], false).unwrap_err();
        assert!(matches!(err, ProfileError::MalformedHeader(0)));
    }

    #[test]
    fn test_zero_order_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        let err = load_bytes(&bytes, false).unwrap_err();
        assert!(matches!(err, ProfileError::MalformedHeader(0)));
    }

    #[test]
    fn test_truncated_record() {
        let mut bytes = write_order1(&[(0, 1, 1)]);
        bytes.truncate(bytes.len() - 4);
        let err = load_bytes(&bytes, false).unwrap_err();
        assert!(matches!(err, ProfileError::TruncatedRecord { record: 0, .. }));
    }

    #[test]
    fn test_duplicate_edge() {
        let bytes = write_order1(&[(0, 1, 1), (0, 1, 2)]);
        let err = load_bytes(&bytes, false).unwrap_err();
        assert!(matches!(err, ProfileError::DuplicateEdge { record: 1, .. }));
    }

    #[test]
    fn test_hot_code_requires_order1() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        let err = load_bytes(&bytes, true).unwrap_err();
        assert!(matches!(err, ProfileError::HotCodeRequiresOrder1(2)));
    }
}
