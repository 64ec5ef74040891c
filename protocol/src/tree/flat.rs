//! # Flat-Tree Indexing
//!
//! Nodes of the Merkle tree are numbered in-order, so that every leaf sits
//! at an even index and every parent at an odd one:
//!
//! ```text
//!        3
//!    1       5
//!  0   2   4   6      <- leaves 0, 1, 2, 3 live at 0, 2, 4, 6
//! ```
//!
//! A node is fully described by `(depth, offset)`: depth is the number of
//! trailing one-bits of its index, offset its position within that level.
//! The numbering never changes as the tree grows, which is what lets nodes
//! be persisted once under their index and never rewritten.

use crate::config::MAX_TREE_DEPTH;

/// Flat index of the node at `depth` and `offset`.
pub fn index(depth: u32, offset: u64) -> u64 {
    (offset << (depth + 1)) | ((1u64 << depth) - 1)
}

/// Depth of a node. Leaves have depth 0.
pub fn depth(index: u64) -> u32 {
    index.trailing_ones()
}

/// Position of a node within its level.
pub fn offset(index: u64) -> u64 {
    index >> (depth(index) + 1)
}

/// Flat index of the leaf holding block `block`.
pub fn leaf(block: u64) -> u64 {
    block * 2
}

/// Block number of a leaf node.
pub fn block_of(leaf: u64) -> u64 {
    leaf / 2
}

/// Parent of a node.
pub fn parent(index: u64) -> u64 {
    let d = depth(index);
    self::index(d + 1, offset(index) >> 1)
}

/// The other child of this node's parent.
pub fn sibling(index: u64) -> u64 {
    let d = depth(index);
    self::index(d, offset(index) ^ 1)
}

/// Whether the node is the left child of its parent.
pub fn is_left(index: u64) -> bool {
    offset(index) & 1 == 0
}

/// The two children of a node, or `None` for a leaf.
pub fn children(index: u64) -> Option<(u64, u64)> {
    let d = depth(index);
    if d == 0 {
        return None;
    }
    let off = offset(index) * 2;
    Some((self::index(d - 1, off), self::index(d - 1, off + 1)))
}

/// Whether `index` could name a node of a log no longer than
/// [`MAX_LOG_LENGTH`](crate::config::MAX_LOG_LENGTH). Parents and siblings
/// of such nodes are computed without overflow.
pub fn is_valid(index: u64) -> bool {
    depth(index) < MAX_TREE_DEPTH && index < (1u64 << MAX_TREE_DEPTH)
}

/// Leftmost leaf (flat index) under this node.
pub fn left_span(index: u64) -> u64 {
    let d = depth(index);
    if d == 0 {
        index
    } else {
        offset(index) << (d + 1)
    }
}

/// Rightmost leaf (flat index) under this node.
pub fn right_span(index: u64) -> u64 {
    let d = depth(index);
    if d == 0 {
        index
    } else {
        ((offset(index) + 1) << (d + 1)) - 2
    }
}

/// Number of leaves under this node.
pub fn leaf_count(index: u64) -> u64 {
    1u64 << depth(index)
}

/// Whether every leaf under `index` is a block below `length`.
pub fn within(index: u64, length: u64) -> bool {
    right_span(index) < leaf(length)
}

/// Whether `ancestor` covers `index` (a node counts as covering itself).
pub fn covers(ancestor: u64, index: u64) -> bool {
    left_span(ancestor) <= left_span(index) && right_span(index) <= right_span(ancestor)
}

/// Roots of the perfect subtrees covering blocks `[0, length)`, largest
/// first.
///
/// ```
/// use strata_protocol::tree::flat;
///
/// assert_eq!(flat::full_roots(3), vec![1, 4]);
/// assert_eq!(flat::full_roots(4), vec![3]);
/// ```
pub fn full_roots(length: u64) -> Vec<u64> {
    let mut roots = Vec::new();
    let mut remaining = length;
    let mut start = 0u64;
    while remaining > 0 {
        let factor = 1u64 << (63 - remaining.leading_zeros());
        roots.push(start + factor - 1);
        start += 2 * factor;
        remaining -= factor;
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_and_inverse() {
        assert_eq!(index(0, 0), 0);
        assert_eq!(index(0, 3), 6);
        assert_eq!(index(1, 0), 1);
        assert_eq!(index(1, 1), 5);
        assert_eq!(index(2, 0), 3);
        for i in 0..200u64 {
            assert_eq!(index(depth(i), offset(i)), i);
        }
    }

    #[test]
    fn parent_and_sibling() {
        assert_eq!(parent(0), 1);
        assert_eq!(parent(2), 1);
        assert_eq!(parent(1), 3);
        assert_eq!(parent(5), 3);
        assert_eq!(sibling(0), 2);
        assert_eq!(sibling(2), 0);
        assert_eq!(sibling(1), 5);
        assert!(is_left(0));
        assert!(!is_left(2));
    }

    #[test]
    fn children_of_parents_only() {
        assert_eq!(children(0), None);
        assert_eq!(children(1), Some((0, 2)));
        assert_eq!(children(3), Some((1, 5)));
        assert_eq!(children(11), Some((9, 13)));
    }

    #[test]
    fn spans() {
        assert_eq!(left_span(3), 0);
        assert_eq!(right_span(3), 6);
        assert_eq!(left_span(11), 8);
        assert_eq!(right_span(11), 14);
        assert_eq!(leaf_count(3), 4);
        assert_eq!(leaf_count(4), 1);
    }

    #[test]
    fn validity_stops_below_the_top_bits() {
        use crate::config::MAX_LOG_LENGTH;

        assert!(is_valid(0));
        assert!(is_valid(leaf(MAX_LOG_LENGTH - 1)));
        assert!(is_valid(full_roots(MAX_LOG_LENGTH)[0]));
        assert!(!is_valid(u64::MAX));
        assert!(!is_valid(u64::MAX >> 1));
        assert!(!is_valid(1 << 62));
        // The root of the longest log still has a computable parent.
        let root = full_roots(MAX_LOG_LENGTH)[0];
        assert_eq!(depth(parent(root)), MAX_TREE_DEPTH);
    }

    #[test]
    fn within_length() {
        assert!(within(1, 2));
        assert!(!within(1, 1));
        assert!(within(0, 1));
        assert!(!within(3, 3));
    }

    #[test]
    fn full_roots_match_binary_decomposition() {
        assert!(full_roots(0).is_empty());
        assert_eq!(full_roots(1), vec![0]);
        assert_eq!(full_roots(2), vec![1]);
        assert_eq!(full_roots(5), vec![3, 8]);
        assert_eq!(full_roots(7), vec![3, 9, 12]);
        for length in 1..100u64 {
            let total: u64 = full_roots(length).iter().map(|r| leaf_count(*r)).sum();
            assert_eq!(total, length);
        }
    }

    #[test]
    fn covers_is_reflexive_and_ancestral() {
        assert!(covers(3, 3));
        assert!(covers(3, 4));
        assert!(covers(7, 12));
        assert!(!covers(1, 4));
    }
}
