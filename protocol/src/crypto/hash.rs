//! # Hashing
//!
//! BLAKE3 is the only hash function in Strata. Every node in the Merkle tree
//! is hashed with a one-byte type tag in front of it so that a leaf can never
//! be confused with a parent, and a parent can never be confused with a tree
//! hash:
//!
//! ```text
//! leaf   = H(0x00 ‖ size_be64 ‖ bytes)
//! parent = H(0x01 ‖ (left.size + right.size)_be64 ‖ left.hash ‖ right.hash)
//! tree   = H(0x02 ‖ Σ(root.hash ‖ root.index_be64 ‖ root.size_be64))
//! ```
//!
//! Sizes are folded into every node so that a verified hash also pins the
//! number of bytes underneath it. That is what makes byte-offset seeks
//! verifiable, not just index lookups.
//!
//! Two more derivations use BLAKE3's `derive_key` mode for domain
//! separation: the discovery identifier (what peers call a log on the wire)
//! and the signable digest over `(tree hash, length, fork)`.

use crate::config::{
    DISCOVERY_CONTEXT, LEAF_TYPE, PARENT_TYPE, ROOT_TYPE, SIGNATURE_CONTEXT,
};

/// A 32-byte BLAKE3 digest.
pub type Hash = [u8; 32];

/// Compute the plain BLAKE3 hash of the input data.
///
/// # Example
///
/// ```
/// use strata_protocol::crypto::blake3_hash;
///
/// let hash = blake3_hash(b"strata");
/// assert_eq!(hash.len(), 32);
/// ```
pub fn blake3_hash(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Compute a domain-separated hash using BLAKE3's `derive_key` mode.
///
/// `domain_separated_hash("a", data)` and `domain_separated_hash("b", data)`
/// never collide, because the context string selects a different IV.
pub fn domain_separated_hash(context: &str, data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Hash a block's bytes into its leaf node hash.
pub fn leaf_hash(data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_TYPE]);
    hasher.update(&(data.len() as u64).to_be_bytes());
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Hash two sibling nodes into their parent.
///
/// Order matters: `left` must be the node with the lower flat-tree index.
pub fn parent_hash(left: &Hash, left_size: u64, right: &Hash, right_size: u64) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[PARENT_TYPE]);
    hasher.update(&(left_size + right_size).to_be_bytes());
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

/// Hash an ordered list of root nodes, given as `(hash, index, size)`, into
/// the single tree hash that gets signed.
pub fn tree_hash<I>(roots: I) -> Hash
where
    I: IntoIterator<Item = (Hash, u64, u64)>,
{
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[ROOT_TYPE]);
    for (hash, index, size) in roots {
        hasher.update(&hash);
        hasher.update(&index.to_be_bytes());
        hasher.update(&size.to_be_bytes());
    }
    *hasher.finalize().as_bytes()
}

/// The digest the writer signs for a given tree state.
///
/// Binding `length` and `fork` next to the tree hash means a signature for
/// one fork can never be replayed as a signature for another.
pub fn signable(tree_hash: &Hash, length: u64, fork: u64) -> Hash {
    let mut buf = Vec::with_capacity(48);
    buf.extend_from_slice(tree_hash);
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(&fork.to_be_bytes());
    domain_separated_hash(SIGNATURE_CONTEXT, &buf)
}

/// Derive the discovery identifier for a log from its public key.
///
/// The derivation is one-way: peers that already know the public key can
/// compute it and agree to talk about the log, while an eavesdropper who
/// sees only the discovery identifier learns nothing about the key.
pub fn discovery_key(public_key: &[u8; 32]) -> Hash {
    domain_separated_hash(DISCOVERY_CONTEXT, public_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake3_deterministic() {
        let a = blake3_hash(b"strata");
        let b = blake3_hash(b"strata");
        assert_eq!(a, b);
    }

    #[test]
    fn leaf_hash_differs_from_plain_hash() {
        // The type tag and size prefix must change the digest.
        assert_ne!(leaf_hash(b"block"), blake3_hash(b"block"));
    }

    #[test]
    fn leaf_hash_binds_content() {
        assert_ne!(leaf_hash(b"a"), leaf_hash(b"b"));
        assert_ne!(leaf_hash(b""), leaf_hash(b"\0"));
    }

    #[test]
    fn parent_hash_is_order_sensitive() {
        let a = leaf_hash(b"left");
        let b = leaf_hash(b"right");
        assert_ne!(parent_hash(&a, 4, &b, 5), parent_hash(&b, 5, &a, 4));
    }

    #[test]
    fn parent_hash_binds_sizes() {
        let a = leaf_hash(b"x");
        let b = leaf_hash(b"y");
        assert_ne!(parent_hash(&a, 1, &b, 1), parent_hash(&a, 2, &b, 1));
    }

    #[test]
    fn tree_hash_depends_on_root_positions() {
        let h = leaf_hash(b"root");
        let one = tree_hash([(h, 0, 4)]);
        let other = tree_hash([(h, 2, 4)]);
        assert_ne!(one, other);
    }

    #[test]
    fn signable_binds_length_and_fork() {
        let h = tree_hash([(leaf_hash(b"a"), 0, 1)]);
        assert_ne!(signable(&h, 1, 0), signable(&h, 1, 1));
        assert_ne!(signable(&h, 1, 0), signable(&h, 2, 0));
    }

    #[test]
    fn discovery_key_is_not_the_public_key() {
        let pk = [7u8; 32];
        let dk = discovery_key(&pk);
        assert_ne!(dk, pk);
        assert_eq!(dk, discovery_key(&pk));
    }

    #[test]
    fn test_domain_separation() {
        let data = b"same data";
        assert_ne!(
            domain_separated_hash("context-a", data),
            domain_separated_hash("context-b", data)
        );
    }
}
