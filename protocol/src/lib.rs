// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Strata: Core Library
//!
//! A single-writer, multi-reader append-only log whose every block can be
//! verified on its own. The writer signs a Merkle tree over the blocks;
//! readers download any subset of blocks from any peer and check each one
//! against that signature before storing it.
//!
//! ## Architecture
//!
//! - **crypto**: BLAKE3 hashing, Ed25519 keys and signatures.
//! - **storage**: sled regions for identity, tree nodes, bitfield and data.
//! - **tree**: flat-tree Merkle tree, proofs, upgrades and seeking.
//! - **log**: the [`Log`] handle: local reads and writes, reorgs, events.
//! - **replication**: wire protocol, per-peer sessions, request dispatch,
//!   range downloads and extensions.
//! - **config**: protocol constants.
//!
//! ## Quick Start
//!
//! ```no_run
//! # async fn demo() -> strata_protocol::LogResult<()> {
//! use strata_protocol::{Log, LogOptions};
//!
//! let writer = Log::open(LogOptions::temporary()).await?;
//! writer.append(&[b"hello".as_slice(), b"world"]).await?;
//!
//! let reader = Log::open(LogOptions::temporary().reader_of(writer.public_key())).await?;
//! let (a, b) = tokio::io::duplex(64 * 1024);
//! let _w = writer.replicate(a);
//! let _r = reader.replicate(b);
//! assert_eq!(reader.get(1).await?.as_ref(), b"world");
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! 1. Nothing unverified is ever written to storage.
//! 2. A reader never silently rewrites history: a fork that discards held
//!    blocks is surfaced as a pending reorg.
//! 3. Local mutation never spans an `.await`.

pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod log;
pub mod replication;
pub mod storage;
pub mod tree;

pub use crypto::{Hash, Keypair, PublicKey, Signature};
pub use error::{LogError, LogResult};
pub use events::{LogEvent, PeerId};
pub use log::{LocalState, Log, LogOptions, LogStatus, ReorgNotice, UpgradeOutcome};
pub use replication::{
    Extension, ExtensionError, ExtensionHandler, Mux, PeerInfo, PeerPhase, RangeHandle,
    RangeSummary, ReplicationConfig,
};
pub use storage::{Identity, Storage};
pub use tree::{BlockProof, UpgradeProof};
