//! # Cryptographic Primitives
//!
//! Everything the log needs from cryptography flows through this module:
//!
//! - **BLAKE3** for leaf, parent and tree hashes, and for deriving the
//!   discovery identifier that names a log on the wire.
//! - **Ed25519** for signing tree states. A log has exactly one signing
//!   identity; readers only ever hold the public half.
//!
//! Everything here is a thin, type-safe wrapper around `blake3` and
//! `ed25519-dalek`. The tree and replication layers never touch those
//! crates directly.

pub mod hash;
pub mod keys;

pub use hash::{
    blake3_hash, discovery_key, domain_separated_hash, leaf_hash, parent_hash, signable, tree_hash,
    Hash,
};
pub use keys::{KeyError, Keypair, PublicKey, Signature};
