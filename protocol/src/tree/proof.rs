//! # Proofs
//!
//! Three kinds of proof travel between peers, and all of them are checked
//! here without touching storage:
//!
//! - [`BlockProof`]: the sibling path from one leaf up to the root segment
//!   that covers it. The verifier hashes the block bytes into a leaf, folds
//!   in the siblings, and must land exactly on one of its trusted roots.
//! - [`UpgradeProof`]: a signed tree state (roots + signature) plus the
//!   nodes showing that every root of the verifier's shorter tree hangs
//!   underneath the new roots. This is what stops a peer from "extending"
//!   a log with a history that does not contain the old one.
//! - Seek fragments: pairs of children along a root-to-leaf path, each pair
//!   checked against its already-trusted parent (see `MerkleTree::add_nodes`).
//!
//! Every function returns the nodes it verified, so the caller can persist
//! them and later serve proofs of its own.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{flat, Node, TreeError};
use crate::config::{MAX_LOG_LENGTH, MAX_TREE_DEPTH};
use crate::crypto::keys::{PublicKey, Signature};
use crate::crypto::{signable, tree_hash, Hash};

/// Sibling path proving one block against a root segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockProof {
    pub index: u64,
    /// Siblings from the leaf upward, nearest first.
    pub nodes: Vec<Node>,
}

/// A signed tree state, plus consistency nodes relative to `from_length`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeProof {
    pub fork: u64,
    pub length: u64,
    pub roots: Vec<Node>,
    pub signature: Signature,
    /// Length of the tree the consistency nodes were computed against.
    pub from_length: u64,
    pub nodes: Vec<Node>,
}

impl UpgradeProof {
    /// Bytes under the roots. Saturates; [`verify_signature`] rejects root
    /// lists whose sizes overflow.
    pub fn byte_length(&self) -> u64 {
        self.roots.iter().fold(0u64, |total, r| total.saturating_add(r.size))
    }

    /// The tree hash these roots commit to.
    pub fn tree_hash(&self) -> Hash {
        root_hash(&self.roots)
    }
}

/// Tree hash over an ordered root list.
pub fn root_hash(roots: &[Node]) -> Hash {
    tree_hash(roots.iter().map(|r| (r.hash, r.index, r.size)))
}

/// Verify `data` as block `index` against `roots`.
///
/// On success returns every node on the path (leaf, siblings and computed
/// parents, excluding the root itself), ready to be persisted.
pub fn verify_block(
    index: u64,
    data: &[u8],
    proof: &BlockProof,
    roots: &[Node],
) -> Result<Vec<Node>, TreeError> {
    if proof.index != index {
        return Err(TreeError::MalformedProof(format!(
            "proof for block {} offered for block {}",
            proof.index, index
        )));
    }
    if proof.nodes.len() > MAX_TREE_DEPTH as usize {
        return Err(TreeError::MalformedProof("proof deeper than any tree".into()));
    }
    if index >= MAX_LOG_LENGTH {
        return Err(TreeError::MalformedProof(format!("block {index} is past any log")));
    }

    let mut current = Node::leaf(index, data);
    let mut path = Vec::with_capacity(proof.nodes.len() * 2 + 1);
    path.push(current);
    for sibling in &proof.nodes {
        if sibling.index != flat::sibling(current.index) {
            return Err(TreeError::MalformedProof(format!(
                "node {} is not the sibling of {}",
                sibling.index, current.index
            )));
        }
        path.push(*sibling);
        current = current.join(sibling)?;
        path.push(current);
    }

    // The last computed node is the root itself; callers already hold it.
    let root = path.pop().unwrap_or(current);
    match roots.iter().find(|r| r.index == root.index) {
        Some(trusted) if trusted.hash == root.hash && trusted.size == root.size => Ok(path),
        _ => Err(TreeError::ProofMismatch { index }),
    }
}

/// Check the writer's signature and the shape of the root list.
pub fn verify_signature(proof: &UpgradeProof, public_key: &PublicKey) -> Result<(), TreeError> {
    if proof.length > MAX_LOG_LENGTH {
        return Err(TreeError::MalformedProof(format!(
            "length {} exceeds the longest possible log",
            proof.length
        )));
    }
    let expected: Vec<u64> = flat::full_roots(proof.length);
    let actual: Vec<u64> = proof.roots.iter().map(|r| r.index).collect();
    if expected != actual {
        return Err(TreeError::MalformedProof(format!(
            "roots {:?} do not describe a tree of length {}",
            actual, proof.length
        )));
    }
    if proof.roots.iter().try_fold(0u64, |total, r| total.checked_add(r.size)).is_none() {
        return Err(TreeError::MalformedProof("root sizes overflow".into()));
    }
    let message = signable(&proof.tree_hash(), proof.length, proof.fork);
    if !public_key.verify(&message, &proof.signature) {
        return Err(TreeError::BadSignature);
    }
    Ok(())
}

/// Check that every one of `old_roots` sits underneath `proof.roots`.
///
/// Returns the intermediate nodes that were supplied or computed along the
/// way.
pub fn verify_consistency(old_roots: &[Node], proof: &UpgradeProof) -> Result<Vec<Node>, TreeError> {
    let new_roots: HashMap<u64, &Node> = proof.roots.iter().map(|r| (r.index, r)).collect();
    let mut known: HashMap<u64, Node> = proof.nodes.iter().map(|n| (n.index, *n)).collect();
    for root in old_roots {
        known.entry(root.index).or_insert(*root);
    }

    let mut verified = Vec::new();
    for old in old_roots {
        let mut current = *old;
        let mut steps = 0;
        while !new_roots.contains_key(&current.index) {
            steps += 1;
            if steps > MAX_TREE_DEPTH || !flat::is_valid(current.index) {
                return Err(TreeError::MalformedProof("consistency path too deep".into()));
            }
            let sibling_index = flat::sibling(current.index);
            let sibling = *known.get(&sibling_index).ok_or_else(|| {
                TreeError::MalformedProof(format!("consistency proof lacks node {}", sibling_index))
            })?;
            let parent = current.join(&sibling)?;
            if let Some(claimed) = known.get(&parent.index) {
                if claimed.hash != parent.hash || claimed.size != parent.size {
                    return Err(TreeError::ProofMismatch {
                        index: flat::block_of(flat::left_span(parent.index)),
                    });
                }
            }
            verified.push(sibling);
            known.insert(parent.index, parent);
            current = parent;
        }
        let trusted = new_roots[&current.index];
        if trusted.hash != current.hash || trusted.size != current.size {
            return Err(TreeError::ProofMismatch {
                index: flat::block_of(flat::left_span(current.index)),
            });
        }
        if current.index != old.index {
            verified.push(current);
        }
    }
    verified.retain(|n| !new_roots.contains_key(&n.index));
    Ok(verified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::Keypair;

    fn build(blocks: &[&[u8]]) -> (Vec<Node>, HashMap<u64, Node>) {
        // Reference construction: hash everything, keep every node.
        let mut all = HashMap::new();
        let mut roots: Vec<Node> = Vec::new();
        for (i, data) in blocks.iter().enumerate() {
            let mut node = Node::leaf(i as u64, data);
            all.insert(node.index, node);
            while let Some(last) = roots.last() {
                if flat::depth(last.index) != flat::depth(node.index) {
                    break;
                }
                let left = roots.pop().unwrap();
                node = Node::parent(&left, &node).unwrap();
                all.insert(node.index, node);
            }
            roots.push(node);
        }
        (roots, all)
    }

    fn proof_for(index: u64, roots: &[Node], all: &HashMap<u64, Node>) -> BlockProof {
        let mut nodes = Vec::new();
        let mut cur = flat::leaf(index);
        while !roots.iter().any(|r| r.index == cur) {
            nodes.push(all[&flat::sibling(cur)]);
            cur = flat::parent(cur);
        }
        BlockProof { index, nodes }
    }

    #[test]
    fn valid_block_proof_verifies() {
        let blocks: Vec<&[u8]> = vec![b"a", b"b", b"c", b"d", b"e"];
        let (roots, all) = build(&blocks);
        for (i, data) in blocks.iter().enumerate() {
            let proof = proof_for(i as u64, &roots, &all);
            let path = verify_block(i as u64, data, &proof, &roots).unwrap();
            assert_eq!(path[0], all[&flat::leaf(i as u64)]);
        }
    }

    #[test]
    fn flipped_byte_fails_verification() {
        let blocks: Vec<&[u8]> = vec![b"alpha", b"beta", b"gamma"];
        let (roots, all) = build(&blocks);
        let proof = proof_for(1, &roots, &all);
        let mut tampered = b"beta".to_vec();
        for i in 0..tampered.len() {
            tampered[i] ^= 0x01;
            let err = verify_block(1, &tampered, &proof, &roots).unwrap_err();
            assert!(matches!(err, TreeError::ProofMismatch { index: 1 }));
            tampered[i] ^= 0x01;
        }
    }

    #[test]
    fn misplaced_sibling_is_malformed() {
        let blocks: Vec<&[u8]> = vec![b"a", b"b", b"c", b"d"];
        let (roots, all) = build(&blocks);
        let mut proof = proof_for(0, &roots, &all);
        proof.nodes.swap(0, 1);
        assert!(matches!(
            verify_block(0, b"a", &proof, &roots).unwrap_err(),
            TreeError::MalformedProof(_)
        ));
    }

    #[test]
    fn signature_and_consistency() {
        let kp = Keypair::generate();
        let blocks: Vec<&[u8]> = vec![b"a", b"b", b"c", b"d", b"e", b"f"];
        let (old_roots, _) = build(&blocks[..3]);
        let (roots, all) = build(&blocks);

        let tree = root_hash(&roots);
        let signature = kp.sign(&signable(&tree, 6, 0));
        // Old roots are 1 and 4; new roots are 3 and 9. Leaf 4 needs its
        // sibling 6, and node 1 needs node 5.
        let proof = UpgradeProof {
            fork: 0,
            length: 6,
            roots: roots.clone(),
            signature,
            from_length: 3,
            nodes: vec![all[&6], all[&5]],
        };
        verify_signature(&proof, &kp.public_key()).unwrap();
        let verified = verify_consistency(&old_roots, &proof).unwrap();
        assert!(verified.iter().any(|n| n.index == 5));

        let other = Keypair::generate();
        assert!(matches!(
            verify_signature(&proof, &other.public_key()).unwrap_err(),
            TreeError::BadSignature
        ));
    }

    #[test]
    fn inconsistent_history_is_rejected() {
        let blocks: Vec<&[u8]> = vec![b"a", b"b", b"c", b"d"];
        let forged: Vec<&[u8]> = vec![b"a", b"X", b"c", b"d"];
        let (old_roots, _) = build(&blocks[..2]);
        let (roots, all) = build(&forged);
        let kp = Keypair::generate();
        let proof = UpgradeProof {
            fork: 0,
            length: 4,
            signature: kp.sign(&signable(&root_hash(&roots), 4, 0)),
            roots,
            from_length: 2,
            nodes: vec![all[&5]],
        };
        assert!(matches!(
            verify_consistency(&old_roots, &proof).unwrap_err(),
            TreeError::ProofMismatch { .. }
        ));
    }

    #[test]
    fn oversized_sibling_is_malformed_not_a_panic() {
        let blocks: Vec<&[u8]> = vec![b"a", b"b"];
        let (roots, _) = build(&blocks);
        let mut sibling = Node::leaf(1, b"b");
        sibling.size = u64::MAX;
        let proof = BlockProof {
            index: 0,
            nodes: vec![sibling],
        };
        assert!(matches!(
            verify_block(0, b"a", &proof, &roots).unwrap_err(),
            TreeError::MalformedProof(_)
        ));
    }

    #[test]
    fn overlong_proofs_and_indices_are_malformed() {
        let blocks: Vec<&[u8]> = vec![b"a", b"b"];
        let (roots, all) = build(&blocks);
        let mut proof = proof_for(0, &roots, &all);
        proof.nodes = vec![all[&2]; MAX_TREE_DEPTH as usize + 1];
        assert!(matches!(
            verify_block(0, b"a", &proof, &roots).unwrap_err(),
            TreeError::MalformedProof(_)
        ));

        let far = BlockProof {
            index: u64::MAX,
            nodes: Vec::new(),
        };
        assert!(matches!(
            verify_block(u64::MAX, b"a", &far, &roots).unwrap_err(),
            TreeError::MalformedProof(_)
        ));
    }

    #[test]
    fn overflowing_roots_are_rejected_before_the_signature() {
        let kp = Keypair::generate();
        let blocks: Vec<&[u8]> = vec![b"a", b"b", b"c"];
        let (mut roots, _) = build(&blocks);
        roots[0].size = u64::MAX;
        let proof = UpgradeProof {
            fork: 0,
            length: 3,
            signature: kp.sign(&signable(&root_hash(&roots), 3, 0)),
            roots: roots.clone(),
            from_length: 0,
            nodes: Vec::new(),
        };
        assert!(matches!(
            verify_signature(&proof, &kp.public_key()).unwrap_err(),
            TreeError::MalformedProof(_)
        ));
        assert_eq!(proof.byte_length(), u64::MAX);

        let endless = UpgradeProof {
            length: u64::MAX,
            ..proof
        };
        assert!(matches!(
            verify_signature(&endless, &kp.public_key()).unwrap_err(),
            TreeError::MalformedProof(_)
        ));
    }
}
