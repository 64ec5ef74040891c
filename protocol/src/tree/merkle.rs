//! # Merkle Tree
//!
//! The authenticated index of a log. Holds the current root segments in
//! memory and every other known node in the `tree` region, keyed by its
//! flat index.
//!
//! ## Design Decisions
//!
//! - **Nodes are written once.** Flat indices never move as the tree grows,
//!   so an appended node is persisted under its index and only ever
//!   removed again by a truncation or an accepted reorg.
//! - **Readers hold a sparse tree.** A reader starts with nothing but the
//!   signed roots and accumulates the paths of the blocks it verifies. Any
//!   operation that needs an absent node fails with
//!   [`TreeError::MissingNode`] rather than guessing.
//! - **Reorg fork points are lower bounds.** A reorg keeps only the new
//!   roots that match nodes held locally, so a reader that never saw the
//!   left part of a root places the fork point before it and discards
//!   blocks the writer did not change. They are fetched and verified again
//!   on demand. A fork point claimed by the writer is never trusted, since
//!   nothing signs it.
//! - **The tree does not sign.** [`MerkleTree::signable`] exposes the bytes
//!   to sign; the writer owns the key and hands back the signature.

use std::collections::{HashMap, HashSet};

use sled::Tree;
use tracing::{debug, trace};

use super::proof::{root_hash, verify_consistency, verify_signature, BlockProof, UpgradeProof};
use super::{flat, Node, TreeError};
use crate::config::MAX_TREE_DEPTH;
use crate::crypto::keys::{PublicKey, Signature};
use crate::crypto::{signable, Hash};
use crate::storage::db::{key, remove_from};
use crate::storage::{BlockLocation, StorageError, TreeHeader};

/// How a verified upgrade relates to the local tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeKind {
    /// Nothing newer than what is already held.
    Unchanged,
    /// A longer tree on the same fork that contains the local one.
    Extend { from: u64 },
    /// A tree on a newer fork. Blocks at or above `fork_point` may differ.
    Reorg { fork_point: u64 },
}

/// An [`UpgradeProof`] that passed verification against this tree.
#[derive(Debug, Clone)]
pub struct VerifiedUpgrade {
    pub kind: UpgradeKind,
    proof: UpgradeProof,
    nodes: Vec<Node>,
}

impl VerifiedUpgrade {
    pub fn fork(&self) -> u64 {
        self.proof.fork
    }

    pub fn length(&self) -> u64 {
        self.proof.length
    }

    pub fn byte_length(&self) -> u64 {
        self.proof.byte_length()
    }
}

/// The Merkle tree of one log.
#[derive(Debug)]
pub struct MerkleTree {
    region: Tree,
    fork: u64,
    length: u64,
    byte_length: u64,
    roots: Vec<Node>,
    signature: Option<Signature>,
}

impl MerkleTree {
    /// Load the tree described by `header`, or start empty on `fork`.
    pub fn open(region: Tree, header: Option<TreeHeader>, fork: u64) -> Result<Self, TreeError> {
        let mut tree = Self {
            region,
            fork,
            length: 0,
            byte_length: 0,
            roots: Vec::new(),
            signature: None,
        };
        if let Some(header) = header {
            tree.fork = header.fork;
            tree.length = header.length;
            tree.signature = header.signature;
            tree.roots = flat::full_roots(header.length)
                .into_iter()
                .map(|i| tree.require_node(i))
                .collect::<Result<_, _>>()?;
            tree.byte_length = tree.roots.iter().map(|r| r.size).sum();
            if tree.byte_length != header.byte_length {
                return Err(StorageError::Corrupt(format!(
                    "roots span {} bytes, header says {}",
                    tree.byte_length, header.byte_length
                ))
                .into());
            }
        }
        debug!(length = tree.length, fork = tree.fork, "opened merkle tree");
        Ok(tree)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn byte_length(&self) -> u64 {
        self.byte_length
    }

    pub fn fork(&self) -> u64 {
        self.fork
    }

    pub fn roots(&self) -> &[Node] {
        &self.roots
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    /// Hash of the ordered root list.
    pub fn tree_hash(&self) -> Hash {
        root_hash(&self.roots)
    }

    /// The bytes the writer signs for the current state.
    pub fn signable(&self) -> Hash {
        signable(&self.tree_hash(), self.length, self.fork)
    }

    pub fn set_signature(&mut self, signature: Signature) {
        self.signature = Some(signature);
    }

    /// The state to persist in the identity region.
    pub fn header(&self) -> TreeHeader {
        TreeHeader {
            fork: self.fork,
            length: self.length,
            byte_length: self.byte_length,
            signature: self.signature.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Node access
    // -----------------------------------------------------------------------

    pub fn get_node(&self, index: u64) -> Result<Option<Node>, TreeError> {
        if let Some(root) = self.roots.iter().find(|r| r.index == index) {
            return Ok(Some(*root));
        }
        match self.region.get(key(index)).map_err(StorageError::from)? {
            Some(bytes) => Ok(Some(Node::decode(index, &bytes)?)),
            None => Ok(None),
        }
    }

    pub fn has_node(&self, index: u64) -> Result<bool, TreeError> {
        Ok(self.get_node(index)?.is_some())
    }

    pub fn require_node(&self, index: u64) -> Result<Node, TreeError> {
        self.get_node(index)?.ok_or(TreeError::MissingNode(index))
    }

    fn put_nodes(&self, nodes: &[Node]) -> Result<(), TreeError> {
        let mut batch = sled::Batch::default();
        for node in nodes {
            batch.insert(&key(node.index)[..], &node.encode()[..]);
        }
        self.region.apply_batch(batch).map_err(StorageError::from)?;
        Ok(())
    }

    fn covering_root(&self, index: u64) -> Result<Node, TreeError> {
        if index >= self.length {
            return Err(TreeError::OutOfBounds {
                index,
                length: self.length,
            });
        }
        let leaf = flat::leaf(index);
        self.roots
            .iter()
            .copied()
            .find(|r| flat::covers(r.index, leaf))
            .ok_or(TreeError::MissingNode(leaf))
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    /// Append blocks. The signature is cleared until the writer re-signs.
    pub fn append<B: AsRef<[u8]>>(&mut self, blocks: &[B]) -> Result<(), TreeError> {
        let mut created = Vec::with_capacity(blocks.len() * 2);
        for data in blocks {
            let mut node = Node::leaf(self.length, data.as_ref());
            created.push(node);
            while let Some(last) = self.roots.last() {
                if flat::depth(last.index) != flat::depth(node.index) {
                    break;
                }
                let left = *last;
                self.roots.pop();
                node = Node::parent(&left, &node)?;
                created.push(node);
            }
            self.roots.push(node);
            self.length += 1;
            self.byte_length += data.as_ref().len() as u64;
        }
        self.put_nodes(&created)?;
        self.signature = None;
        trace!(length = self.length, nodes = created.len(), "appended to tree");
        Ok(())
    }

    /// Remove every node that covers any block at or above `length`.
    fn discard_from(&self, length: u64, old_length: u64) -> Result<(), TreeError> {
        if length >= old_length {
            return Ok(());
        }
        let boundary = flat::leaf(length);
        remove_from(&self.region, boundary)?;

        // Ancestors of the first discarded leaf sit left of it in flat order.
        let mut batch = sled::Batch::default();
        let mut index = boundary;
        for _ in 0..MAX_TREE_DEPTH {
            if flat::left_span(index) == 0 && flat::leaf_count(index) >= old_length {
                break;
            }
            index = flat::parent(index);
            if index < boundary {
                batch.remove(&key(index)[..]);
            }
        }
        self.region.apply_batch(batch).map_err(StorageError::from)?;
        Ok(())
    }

    /// Shrink the tree to `new_length` blocks and move to `new_fork`.
    pub fn truncate(&mut self, new_length: u64, new_fork: u64) -> Result<(), TreeError> {
        if new_length > self.length {
            return Err(TreeError::InvalidTruncate {
                length: self.length,
                requested: new_length,
            });
        }
        self.discard_from(new_length, self.length)?;
        let roots = flat::full_roots(new_length)
            .into_iter()
            .map(|i| self.require_node(i))
            .collect::<Result<Vec<_>, _>>()?;
        self.byte_length = roots.iter().map(|r| r.size).sum();
        self.roots = roots;
        self.length = new_length;
        self.fork = new_fork;
        self.signature = None;
        debug!(length = new_length, fork = new_fork, "truncated tree");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Locating blocks
    // -----------------------------------------------------------------------

    /// Byte offset at which block `index` starts.
    pub fn byte_offset(&self, index: u64) -> Result<u64, TreeError> {
        let root = self.covering_root(index)?;
        let leaf = flat::leaf(index);
        let mut offset: u64 = self
            .roots
            .iter()
            .take_while(|r| r.index != root.index)
            .map(|r| r.size)
            .sum();
        let mut current = root.index;
        while let Some((left, right)) = flat::children(current) {
            if flat::covers(left, leaf) {
                current = left;
            } else {
                offset += self.require_node(left)?.size;
                current = right;
            }
        }
        Ok(offset)
    }

    /// Bytes held by the first `length` blocks, read off the nodes that
    /// cover them.
    pub fn prefix_byte_length(&self, length: u64) -> Result<u64, TreeError> {
        if length > self.length {
            return Err(TreeError::OutOfBounds {
                index: length,
                length: self.length,
            });
        }
        flat::full_roots(length)
            .into_iter()
            .map(|i| self.require_node(i).map(|n| n.size))
            .sum()
    }

    /// Offset and size of block `index`.
    pub fn block_location(&self, index: u64) -> Result<BlockLocation, TreeError> {
        let size = self.require_node(flat::leaf(index))?.size;
        Ok(BlockLocation {
            index,
            offset: self.byte_offset(index)?,
            size,
        })
    }

    // -----------------------------------------------------------------------
    // Proofs
    // -----------------------------------------------------------------------

    /// Sibling path for block `index` up to its covering root.
    pub fn proof(&self, index: u64) -> Result<BlockProof, TreeError> {
        let root = self.covering_root(index)?;
        let mut nodes = Vec::new();
        let mut current = flat::leaf(index);
        while current != root.index {
            nodes.push(self.require_node(flat::sibling(current))?);
            current = flat::parent(current);
        }
        Ok(BlockProof { index, nodes })
    }

    /// Verify `data` as block `index` and persist the verified path.
    pub fn verify_and_add(&mut self, index: u64, data: &[u8], proof: &BlockProof) -> Result<(), TreeError> {
        if index >= self.length {
            return Err(TreeError::OutOfBounds {
                index,
                length: self.length,
            });
        }
        let path = super::proof::verify_block(index, data, proof, &self.roots)?;
        self.put_nodes(&path)
    }

    /// Signed state plus the nodes linking the tree at `from_length` to it.
    ///
    /// Consistency nodes are only included when `from_length` is within the
    /// current tree; a caller on another fork gets the bare signed roots.
    pub fn upgrade_proof(&self, from_length: u64) -> Result<UpgradeProof, TreeError> {
        let signature = self
            .signature
            .clone()
            .ok_or(TreeError::MissingSignature { length: self.length })?;
        let mut nodes = Vec::new();
        if from_length > 0 && from_length <= self.length {
            let new_roots: HashSet<u64> = self.roots.iter().map(|r| r.index).collect();
            let old_roots: HashSet<u64> = flat::full_roots(from_length).into_iter().collect();
            let mut seen = HashSet::new();
            for old in &old_roots {
                let mut current = *old;
                while !new_roots.contains(&current) {
                    let sibling = flat::sibling(current);
                    if !old_roots.contains(&sibling) && seen.insert(sibling) {
                        nodes.push(self.require_node(sibling)?);
                    }
                    current = flat::parent(current);
                }
            }
        }
        Ok(UpgradeProof {
            fork: self.fork,
            length: self.length,
            roots: self.roots.clone(),
            signature,
            from_length,
            nodes,
        })
    }

    /// Check an upgrade proof against this tree without changing it.
    pub fn verify_upgrade(
        &self,
        proof: UpgradeProof,
        public_key: &PublicKey,
    ) -> Result<VerifiedUpgrade, TreeError> {
        verify_signature(&proof, public_key)?;

        if proof.fork < self.fork {
            return Err(TreeError::StaleFork {
                local: self.fork,
                remote: proof.fork,
            });
        }

        if proof.fork > self.fork {
            let fork_point = self.fork_point(&proof)?;
            return Ok(VerifiedUpgrade {
                kind: UpgradeKind::Reorg { fork_point },
                proof,
                nodes: Vec::new(),
            });
        }

        if proof.length < self.length {
            return Ok(VerifiedUpgrade {
                kind: UpgradeKind::Unchanged,
                proof,
                nodes: Vec::new(),
            });
        }
        if proof.length == self.length {
            if proof.tree_hash() != self.tree_hash() {
                return Err(TreeError::Conflict {
                    fork: self.fork,
                    length: self.length,
                });
            }
            return Ok(VerifiedUpgrade {
                kind: UpgradeKind::Unchanged,
                proof,
                nodes: Vec::new(),
            });
        }
        if proof.from_length != self.length {
            return Err(TreeError::MalformedProof(format!(
                "upgrade from length {} offered to a tree of length {}",
                proof.from_length, self.length
            )));
        }
        let nodes = verify_consistency(&self.roots, &proof)?;
        Ok(VerifiedUpgrade {
            kind: UpgradeKind::Extend { from: self.length },
            proof,
            nodes,
        })
    }

    /// Longest prefix of blocks the new roots provably share with ours.
    ///
    /// Never past the true fork point; stops short of it when the matching
    /// node is not held locally.
    fn fork_point(&self, proof: &UpgradeProof) -> Result<u64, TreeError> {
        let mut fork_point = 0;
        for root in &proof.roots {
            if !flat::within(root.index, self.length) {
                break;
            }
            match self.get_node(root.index)? {
                Some(local) if local == *root => fork_point += flat::leaf_count(root.index),
                _ => break,
            }
        }
        Ok(fork_point)
    }

    /// Install a verified upgrade.
    ///
    /// For a reorg, every node beyond the fork point is discarded first; the
    /// caller is responsible for clearing the matching blocks.
    pub fn apply_upgrade(&mut self, upgrade: VerifiedUpgrade) -> Result<UpgradeKind, TreeError> {
        let VerifiedUpgrade { kind, proof, nodes } = upgrade;
        match kind {
            UpgradeKind::Unchanged => return Ok(kind),
            UpgradeKind::Extend { .. } => self.put_nodes(&nodes)?,
            UpgradeKind::Reorg { fork_point } => self.discard_from(fork_point, self.length)?,
        }
        self.put_nodes(&proof.roots)?;
        self.byte_length = proof.byte_length();
        self.roots = proof.roots;
        self.length = proof.length;
        self.fork = proof.fork;
        self.signature = Some(proof.signature);
        debug!(length = self.length, fork = self.fork, ?kind, "applied upgrade");
        Ok(kind)
    }

    // -----------------------------------------------------------------------
    // Seek support
    // -----------------------------------------------------------------------

    /// Child pairs on the path to the block holding `byte_offset`, as seen
    /// by a tree of `at_length` blocks. Pairs are ordered top-down.
    pub fn seek_proof(&self, byte_offset: u64, at_length: u64) -> Result<Vec<Node>, TreeError> {
        if at_length > self.length {
            return Err(TreeError::OutOfBounds {
                index: at_length,
                length: self.length,
            });
        }
        let mut remaining = byte_offset;
        let mut target = None;
        for index in flat::full_roots(at_length) {
            let root = self.require_node(index)?;
            if remaining < root.size {
                target = Some(root);
                break;
            }
            remaining -= root.size;
        }
        let Some(mut current) = target else {
            return Ok(Vec::new());
        };

        let mut pairs = Vec::new();
        while let Some((l, r)) = flat::children(current.index) {
            let left = self.require_node(l)?;
            let right = self.require_node(r)?;
            pairs.push(left);
            pairs.push(right);
            if remaining < left.size {
                current = left;
            } else {
                remaining -= left.size;
                current = right;
            }
        }
        Ok(pairs)
    }

    /// Accept child pairs whose parents are already trusted.
    ///
    /// Pairs are processed in order, so each pair may vouch for the next.
    pub fn add_nodes(&mut self, pairs: &[Node]) -> Result<usize, TreeError> {
        if pairs.len() % 2 != 0 {
            return Err(TreeError::MalformedProof("odd number of seek nodes".into()));
        }
        let mut accepted: HashMap<u64, Node> = HashMap::new();
        for pair in pairs.chunks_exact(2) {
            let (left, right) = (pair[0], pair[1]);
            if !flat::is_valid(left.index)
                || !flat::is_left(left.index)
                || flat::sibling(left.index) != right.index
            {
                return Err(TreeError::MalformedProof(format!(
                    "nodes {} and {} are not a sibling pair",
                    left.index, right.index
                )));
            }
            let parent = Node::parent(&left, &right)?;
            let trusted = match accepted.get(&parent.index) {
                Some(node) => *node,
                None => self.get_node(parent.index)?.ok_or_else(|| {
                    TreeError::MalformedProof(format!("no trusted parent {}", parent.index))
                })?,
            };
            if trusted != parent {
                return Err(TreeError::ProofMismatch {
                    index: flat::block_of(flat::left_span(parent.index)),
                });
            }
            accepted.insert(left.index, left);
            accepted.insert(right.index, right);
        }
        let nodes: Vec<Node> = accepted.into_values().collect();
        self.put_nodes(&nodes)?;
        Ok(nodes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::Keypair;
    use crate::storage::LogDb;

    // -- Helpers --

    fn tree_with(db: &LogDb, blocks: &[&[u8]]) -> MerkleTree {
        let mut tree = MerkleTree::open(db.node_region(), None, 0).unwrap();
        tree.append(blocks).unwrap();
        tree
    }

    fn signed(db: &LogDb, blocks: &[&[u8]], kp: &Keypair) -> MerkleTree {
        let mut tree = tree_with(db, blocks);
        tree.set_signature(kp.sign(&tree.signable()));
        tree
    }

    // -- Appending --

    #[test]
    fn roots_follow_binary_decomposition() {
        let db = LogDb::open_temporary().unwrap();
        let tree = tree_with(&db, &[b"a", b"b", b"c", b"d", b"e"]);
        let indices: Vec<u64> = tree.roots().iter().map(|r| r.index).collect();
        assert_eq!(indices, flat::full_roots(5));
        assert_eq!(tree.length(), 5);
        assert_eq!(tree.byte_length(), 5);
    }

    #[test]
    fn incremental_and_batch_append_agree() {
        let db1 = LogDb::open_temporary().unwrap();
        let db2 = LogDb::open_temporary().unwrap();
        let batch = tree_with(&db1, &[b"one", b"two", b"three"]);
        let mut single = MerkleTree::open(db2.node_region(), None, 0).unwrap();
        for b in [&b"one"[..], b"two", b"three"] {
            single.append(&[b]).unwrap();
        }
        assert_eq!(batch.tree_hash(), single.tree_hash());
    }

    #[test]
    fn reopen_from_header() {
        let db = LogDb::open_temporary().unwrap();
        let header = tree_with(&db, &[b"x", b"yy", b"zzz"]).header();
        let tree = MerkleTree::open(db.node_region(), Some(header.clone()), 0).unwrap();
        assert_eq!(tree.header(), header);
        assert_eq!(tree.byte_length(), 6);
    }

    // -- Locations and proofs --

    #[test]
    fn byte_offsets_sum_previous_sizes() {
        let db = LogDb::open_temporary().unwrap();
        let tree = tree_with(&db, &[b"a", b"bb", b"", b"dddd", b"eeeee"]);
        let offsets: Vec<u64> = (0..5).map(|i| tree.byte_offset(i).unwrap()).collect();
        assert_eq!(offsets, vec![0, 1, 3, 3, 7]);
        assert_eq!(tree.block_location(4).unwrap().size, 5);
        assert_eq!(tree.prefix_byte_length(3).unwrap(), 3);
        assert_eq!(tree.prefix_byte_length(5).unwrap(), 12);
        assert!(matches!(
            tree.byte_offset(5).unwrap_err(),
            TreeError::OutOfBounds { index: 5, length: 5 }
        ));
    }

    #[test]
    fn proofs_verify_in_a_fresh_tree() {
        let kp = Keypair::generate();
        let writer_db = LogDb::open_temporary().unwrap();
        let blocks: Vec<&[u8]> = vec![b"a", b"b", b"c", b"d", b"e", b"f", b"g"];
        let writer = signed(&writer_db, &blocks, &kp);

        let reader_db = LogDb::open_temporary().unwrap();
        let mut reader = MerkleTree::open(reader_db.node_region(), None, 0).unwrap();
        let upgrade = reader
            .verify_upgrade(writer.upgrade_proof(0).unwrap(), &kp.public_key())
            .unwrap();
        assert_eq!(upgrade.kind, UpgradeKind::Extend { from: 0 });
        reader.apply_upgrade(upgrade).unwrap();

        reader.verify_and_add(5, b"f", &writer.proof(5).unwrap()).unwrap();
        assert_eq!(reader.byte_offset(5).unwrap(), 5);
        assert!(reader.has_node(flat::leaf(5)).unwrap());
        // Block 1 was never verified.
        assert!(matches!(reader.block_location(1).unwrap_err(), TreeError::MissingNode(_)));
    }

    // -- Truncation --

    #[test]
    fn truncate_discards_tail_nodes() {
        let db = LogDb::open_temporary().unwrap();
        let mut tree = tree_with(&db, &[b"a", b"b", b"c", b"d", b"e"]);
        let other = LogDb::open_temporary().unwrap();
        let expected = tree_with(&other, &[b"a", b"b", b"c"]);
        tree.truncate(3, 1).unwrap();
        assert_eq!(tree.length(), 3);
        assert_eq!(tree.byte_length(), 3);
        assert_eq!(tree.fork(), 1);
        assert_eq!(tree.tree_hash(), expected.tree_hash());
        // Node 3 covered block 3 and must be gone, as must leaf 6.
        assert!(!tree.has_node(3).unwrap());
        assert!(!tree.has_node(6).unwrap());
        assert!(tree.has_node(1).unwrap());
    }

    #[test]
    fn truncate_cannot_grow() {
        let db = LogDb::open_temporary().unwrap();
        let mut tree = tree_with(&db, &[b"a"]);
        assert!(matches!(
            tree.truncate(2, 1).unwrap_err(),
            TreeError::InvalidTruncate { .. }
        ));
    }

    #[test]
    fn append_after_truncate_matches_fresh_tree() {
        let db = LogDb::open_temporary().unwrap();
        let mut tree = tree_with(&db, &[b"a", b"b", b"c", b"d"]);
        tree.truncate(1, 1).unwrap();
        tree.append(&[b"x", b"y"]).unwrap();
        let other = LogDb::open_temporary().unwrap();
        let fresh = tree_with(&other, &[b"a", b"x", b"y"]);
        assert_eq!(tree.tree_hash(), fresh.tree_hash());
        assert_eq!(tree.proof(2).unwrap(), fresh.proof(2).unwrap());
    }

    // -- Upgrades --

    #[test]
    fn upgrade_extends_reader() {
        let kp = Keypair::generate();
        let wdb = LogDb::open_temporary().unwrap();
        let mut writer = signed(&wdb, &[b"a", b"b", b"c"], &kp);

        let rdb = LogDb::open_temporary().unwrap();
        let mut reader = MerkleTree::open(rdb.node_region(), None, 0).unwrap();
        let first = reader
            .verify_upgrade(writer.upgrade_proof(0).unwrap(), &kp.public_key())
            .unwrap();
        reader.apply_upgrade(first).unwrap();

        writer.append(&[b"d", b"e", b"f"]).unwrap();
        writer.set_signature(kp.sign(&writer.signable()));
        let second = reader
            .verify_upgrade(writer.upgrade_proof(3).unwrap(), &kp.public_key())
            .unwrap();
        assert_eq!(second.kind, UpgradeKind::Extend { from: 3 });
        reader.apply_upgrade(second).unwrap();
        assert_eq!(reader.tree_hash(), writer.tree_hash());
        assert_eq!(reader.length(), 6);
    }

    #[test]
    fn higher_fork_is_a_reorg_with_shared_prefix() {
        let kp = Keypair::generate();
        let wdb = LogDb::open_temporary().unwrap();
        let mut writer = signed(&wdb, &[b"a", b"b", b"c", b"d"], &kp);

        let rdb = LogDb::open_temporary().unwrap();
        let mut reader = MerkleTree::open(rdb.node_region(), None, 0).unwrap();
        let up = reader
            .verify_upgrade(writer.upgrade_proof(0).unwrap(), &kp.public_key())
            .unwrap();
        reader.apply_upgrade(up).unwrap();
        reader.add_nodes(&writer.seek_proof(0, 4).unwrap()).unwrap();

        writer.truncate(2, 1).unwrap();
        writer.append(&[b"X"]).unwrap();
        writer.set_signature(kp.sign(&writer.signable()));

        let reorg = reader
            .verify_upgrade(writer.upgrade_proof(4).unwrap(), &kp.public_key())
            .unwrap();
        assert_eq!(reorg.kind, UpgradeKind::Reorg { fork_point: 2 });
        reader.apply_upgrade(reorg).unwrap();
        assert_eq!(reader.fork(), 1);
        assert_eq!(reader.length(), 3);
        assert_eq!(reader.tree_hash(), writer.tree_hash());
    }

    #[test]
    fn reorg_without_local_nodes_starts_at_zero() {
        let kp = Keypair::generate();
        let wdb = LogDb::open_temporary().unwrap();
        let mut writer = signed(&wdb, &[b"a", b"b", b"c", b"d"], &kp);

        // The reader holds the old root but none of its children.
        let rdb = LogDb::open_temporary().unwrap();
        let mut reader = MerkleTree::open(rdb.node_region(), None, 0).unwrap();
        let up = reader
            .verify_upgrade(writer.upgrade_proof(0).unwrap(), &kp.public_key())
            .unwrap();
        reader.apply_upgrade(up).unwrap();

        writer.truncate(2, 1).unwrap();
        writer.append(&[b"X"]).unwrap();
        writer.set_signature(kp.sign(&writer.signable()));

        let reorg = reader
            .verify_upgrade(writer.upgrade_proof(4).unwrap(), &kp.public_key())
            .unwrap();
        assert_eq!(reorg.kind, UpgradeKind::Reorg { fork_point: 0 });
        reader.apply_upgrade(reorg).unwrap();
        assert_eq!(reader.tree_hash(), writer.tree_hash());

        // Blocks before the real fork point still verify against the new roots.
        reader.verify_and_add(0, b"a", &writer.proof(0).unwrap()).unwrap();
        reader.verify_and_add(2, b"X", &writer.proof(2).unwrap()).unwrap();
    }

    #[test]
    fn stale_fork_and_forgery_rejected() {
        let kp = Keypair::generate();
        let wdb = LogDb::open_temporary().unwrap();
        let writer = signed(&wdb, &[b"a"], &kp);

        let rdb = LogDb::open_temporary().unwrap();
        let mut reader = MerkleTree::open(rdb.node_region(), None, 0).unwrap();
        reader.truncate(0, 2).unwrap();
        assert!(matches!(
            reader
                .verify_upgrade(writer.upgrade_proof(0).unwrap(), &kp.public_key())
                .unwrap_err(),
            TreeError::StaleFork { local: 2, remote: 0 }
        ));

        let impostor = Keypair::generate();
        let fdb = LogDb::open_temporary().unwrap();
        let fresh = MerkleTree::open(fdb.node_region(), None, 0).unwrap();
        assert!(matches!(
            fresh
                .verify_upgrade(writer.upgrade_proof(0).unwrap(), &impostor.public_key())
                .unwrap_err(),
            TreeError::BadSignature
        ));
    }

    // -- Seek nodes --

    #[test]
    fn seek_nodes_need_a_trusted_parent() {
        let kp = Keypair::generate();
        let wdb = LogDb::open_temporary().unwrap();
        let writer = signed(&wdb, &[b"aa", b"bb", b"cc", b"dd"], &kp);
        let rdb = LogDb::open_temporary().unwrap();
        let mut reader = MerkleTree::open(rdb.node_region(), None, 0).unwrap();
        let up = reader
            .verify_upgrade(writer.upgrade_proof(0).unwrap(), &kp.public_key())
            .unwrap();
        reader.apply_upgrade(up).unwrap();

        let mut pairs = writer.seek_proof(5, 4).unwrap();
        assert_eq!(pairs.len(), 4);
        pairs[3].hash[0] ^= 1;
        assert!(matches!(
            reader.add_nodes(&pairs).unwrap_err(),
            TreeError::ProofMismatch { .. }
        ));
        let pairs = writer.seek_proof(5, 4).unwrap();
        assert_eq!(reader.add_nodes(&pairs).unwrap(), 4);
        assert_eq!(reader.byte_offset(2).unwrap(), 4);
    }
}
