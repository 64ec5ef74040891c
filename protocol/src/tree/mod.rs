//! # Tree
//!
//! The Merkle tree that authenticates a log: flat-tree addressing, node
//! encoding, proofs and their verification, and byte-offset seeking.

pub mod flat;
pub mod merkle;
pub mod node;
pub mod proof;
pub mod seek;

pub use merkle::{MerkleTree, UpgradeKind, VerifiedUpgrade};
pub use node::Node;
pub use proof::{root_hash, verify_block, BlockProof, UpgradeProof};
pub use seek::{SeekOutcome, SeekResolver};

use crate::storage::StorageError;

/// Errors raised by tree operations and proof verification.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("block {index} is out of bounds for a tree of length {length}")]
    OutOfBounds { index: u64, length: u64 },

    #[error("tree node {0} is not held locally")]
    MissingNode(u64),

    #[error("proof for block {index} does not match the trusted root")]
    ProofMismatch { index: u64 },

    #[error("malformed proof: {0}")]
    MalformedProof(String),

    #[error("signature does not verify against the log's public key")]
    BadSignature,

    #[error("tree of length {length} has no signature")]
    MissingSignature { length: u64 },

    #[error("cannot truncate a tree of length {length} to {requested}")]
    InvalidTruncate { length: u64, requested: u64 },

    #[error("remote fork {remote} is older than local fork {local}")]
    StaleFork { local: u64, remote: u64 },

    #[error("writer signed two different trees for fork {fork} at length {length}")]
    Conflict { fork: u64, length: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl TreeError {
    /// Whether the error blames the peer that supplied the data.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            TreeError::ProofMismatch { .. }
                | TreeError::MalformedProof(_)
                | TreeError::BadSignature
                | TreeError::Conflict { .. }
        )
    }
}
