//! Tree nodes and their on-disk encoding.

use serde::{Deserialize, Serialize};

use super::{flat, TreeError};
use crate::crypto::{leaf_hash, parent_hash, Hash};
use crate::storage::StorageError;

/// Bytes per encoded node: `size (8B BE) ‖ hash (32B)`.
pub const NODE_ENCODED_LEN: usize = 40;

/// One node of the Merkle tree.
///
/// `size` is the number of block bytes underneath the node, so a verified
/// node also authenticates how many bytes it spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub index: u64,
    pub size: u64,
    pub hash: Hash,
}

impl Node {
    /// The leaf node for block `block` holding `data`.
    pub fn leaf(block: u64, data: &[u8]) -> Self {
        Self {
            index: flat::leaf(block),
            size: data.len() as u64,
            hash: leaf_hash(data),
        }
    }

    /// The parent of two siblings. `left` must be the left child.
    ///
    /// Sizes may come from a peer, so a sum past `u64::MAX` or a node above
    /// the deepest possible tree is a malformed proof rather than a panic.
    pub fn parent(left: &Node, right: &Node) -> Result<Self, TreeError> {
        if !flat::is_valid(left.index) {
            return Err(TreeError::MalformedProof(format!(
                "node {} is deeper than any tree",
                left.index
            )));
        }
        debug_assert_eq!(flat::sibling(left.index), right.index);
        let size = left.size.checked_add(right.size).ok_or_else(|| {
            TreeError::MalformedProof(format!(
                "sizes of nodes {} and {} overflow",
                left.index, right.index
            ))
        })?;
        Ok(Self {
            index: flat::parent(left.index),
            size,
            hash: parent_hash(&left.hash, left.size, &right.hash, right.size),
        })
    }

    /// Combine this node with its sibling, in whichever order they sit.
    pub fn join(&self, sibling: &Node) -> Result<Self, TreeError> {
        if flat::is_left(self.index) {
            Node::parent(self, sibling)
        } else {
            Node::parent(sibling, self)
        }
    }

    pub fn is_leaf(&self) -> bool {
        flat::depth(self.index) == 0
    }

    pub(crate) fn encode(&self) -> [u8; NODE_ENCODED_LEN] {
        let mut buf = [0u8; NODE_ENCODED_LEN];
        buf[..8].copy_from_slice(&self.size.to_be_bytes());
        buf[8..].copy_from_slice(&self.hash);
        buf
    }

    pub(crate) fn decode(index: u64, bytes: &[u8]) -> Result<Self, StorageError> {
        if bytes.len() != NODE_ENCODED_LEN {
            return Err(StorageError::Corrupt(format!(
                "node {} encoded in {} bytes",
                index,
                bytes.len()
            )));
        }
        let mut size = [0u8; 8];
        size.copy_from_slice(&bytes[..8]);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[8..]);
        Ok(Self {
            index,
            size: u64::from_be_bytes(size),
            hash,
        })
    }
}
