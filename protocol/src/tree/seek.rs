//! Byte-offset seeking over a possibly sparse tree.
//!
//! A seek walks from the root segments down to the leaf whose span holds
//! the requested byte, using the `size` of each left child to pick a side.
//! A reader may lack the children it needs, so every step returns one of
//! three outcomes instead of failing.

use super::{flat, MerkleTree, TreeError};

/// Result of one seek step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeekOutcome {
    /// The byte lives in block `index`, `offset` bytes into it.
    Resolved { index: u64, offset: u64 },
    /// These node positions must be fetched before the seek can continue.
    NeedsNodes(Vec<u64>),
    /// The offset lies beyond the local tree; a peer may know a longer one.
    NeedsPeerRoundtrip,
}

/// A resumable seek. Call [`SeekResolver::step`] again after new nodes
/// have been added to the tree; it picks up where it stopped.
#[derive(Debug, Clone)]
pub struct SeekResolver {
    byte_offset: u64,
    cursor: Option<Cursor>,
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    node: u64,
    remaining: u64,
    fork: u64,
    length: u64,
}

impl SeekResolver {
    pub fn new(byte_offset: u64) -> Self {
        Self {
            byte_offset,
            cursor: None,
        }
    }

    pub fn byte_offset(&self) -> u64 {
        self.byte_offset
    }

    /// Advance as far as the locally known nodes allow.
    pub fn step(&mut self, tree: &MerkleTree) -> Result<SeekOutcome, TreeError> {
        // A cursor taken on another tree state is meaningless.
        let resume = self
            .cursor
            .filter(|c| c.fork == tree.fork() && c.length == tree.length());

        let (mut node, mut remaining) = match resume {
            Some(c) => (c.node, c.remaining),
            None => {
                if self.byte_offset >= tree.byte_length() {
                    self.cursor = None;
                    return Ok(SeekOutcome::NeedsPeerRoundtrip);
                }
                let mut remaining = self.byte_offset;
                let mut found = None;
                for root in tree.roots() {
                    if remaining < root.size {
                        found = Some(root.index);
                        break;
                    }
                    remaining -= root.size;
                }
                match found {
                    Some(index) => (index, remaining),
                    None => return Ok(SeekOutcome::NeedsPeerRoundtrip),
                }
            }
        };

        while let Some((left, right)) = flat::children(node) {
            let Some(left_node) = tree.get_node(left)? else {
                self.cursor = Some(Cursor {
                    node,
                    remaining,
                    fork: tree.fork(),
                    length: tree.length(),
                });
                return Ok(SeekOutcome::NeedsNodes(vec![left, right]));
            };
            if remaining < left_node.size {
                node = left;
            } else {
                remaining -= left_node.size;
                node = right;
            }
        }

        self.cursor = None;
        Ok(SeekOutcome::Resolved {
            index: flat::block_of(node),
            offset: remaining,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::Keypair;
    use crate::storage::LogDb;

    #[test]
    fn resolves_locally_on_full_tree() {
        let db = LogDb::open_temporary().unwrap();
        let mut tree = MerkleTree::open(db.node_region(), None, 0).unwrap();
        tree.append(&[&b"abc"[..], b"", b"de", b"fghij"]).unwrap();

        let cases = [(0, 0, 0), (2, 0, 2), (3, 2, 0), (4, 2, 1), (9, 3, 4)];
        for (offset, index, within) in cases {
            let outcome = SeekResolver::new(offset).step(&tree).unwrap();
            assert_eq!(
                outcome,
                SeekOutcome::Resolved {
                    index,
                    offset: within
                },
                "offset {offset}"
            );
        }
        assert_eq!(
            SeekResolver::new(10).step(&tree).unwrap(),
            SeekOutcome::NeedsPeerRoundtrip
        );
    }

    #[test]
    fn sparse_tree_asks_for_nodes_then_resumes() {
        let kp = Keypair::generate();
        let wdb = LogDb::open_temporary().unwrap();
        let mut writer = MerkleTree::open(wdb.node_region(), None, 0).unwrap();
        writer.append(&[&b"aa"[..], b"bb", b"cc", b"dd"]).unwrap();
        writer.set_signature(kp.sign(&writer.signable()));

        let rdb = LogDb::open_temporary().unwrap();
        let mut reader = MerkleTree::open(rdb.node_region(), None, 0).unwrap();
        let up = reader
            .verify_upgrade(writer.upgrade_proof(0).unwrap(), &kp.public_key())
            .unwrap();
        reader.apply_upgrade(up).unwrap();

        let mut seek = SeekResolver::new(7);
        assert_eq!(seek.step(&reader).unwrap(), SeekOutcome::NeedsNodes(vec![1, 5]));

        reader.add_nodes(&writer.seek_proof(7, 4).unwrap()).unwrap();
        assert_eq!(
            seek.step(&reader).unwrap(),
            SeekOutcome::Resolved { index: 3, offset: 1 }
        );
    }
}
