//! # Storage Module
//!
//! Persistence for one log instance. Four independently opened regions,
//! each owned by exactly one component:
//!
//! ```text
//! info.rs         - identity record + last accepted tree header   (info)
//! tree nodes      - owned by crate::tree::MerkleTree               (tree)
//! bitfield.rs     - local block availability                        (bitfield)
//! block_store.rs  - raw block bytes keyed by byte offset            (data)
//! db.rs           - sled database, region handles, writer lock
//! ```
//!
//! ## Design Decisions
//!
//! 1. **sled trees as regions.** One embedded database per log, one named
//!    tree per region. Truncation is a range delete on big-endian keys.
//!
//! 2. **Bincode for records.** The identity record and tree header are
//!    small serde structs; node and block values are raw bytes.
//!
//! 3. **No verification here.** Storage trusts its callers. Everything
//!    that reaches it has been hashed by the writer or verified by the tree.

pub mod bitfield;
pub mod block_store;
pub mod db;
pub mod info;

pub use bitfield::Bitfield;
pub use block_store::{BlockLocation, BlockStore};
pub use db::{LogDb, Storage, StorageError, StorageResult, WriterLock};
pub use info::{Identity, Info, InfoError, TreeHeader};
