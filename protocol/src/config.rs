//! # Protocol Configuration & Constants
//!
//! Every magic number in Strata lives here. Hash tags and derivation
//! contexts are part of the on-disk and on-wire format: changing one makes
//! every existing log unverifiable, so they only move with a version bump.
//!
//! Runtime tunables live next to the code they tune
//! ([`ReplicationConfig`](crate::replication::ReplicationConfig),
//! [`LogOptions`](crate::log::LogOptions)) and take their defaults from the
//! constants below.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Crate-level protocol version string.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Wire protocol version carried in every handshake. Peers with a different
/// version are disconnected before any data is exchanged.
pub const WIRE_PROTOCOL_VERSION: u16 = 1;

/// Protocol name carried in every handshake, so a stray connection from some
/// other protocol is rejected at the first frame.
pub const PROTOCOL_NAME: &str = "strata";

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Type tag prefixed to leaf hashes.
pub const LEAF_TYPE: u8 = 0x00;

/// Type tag prefixed to parent hashes.
pub const PARENT_TYPE: u8 = 0x01;

/// Type tag prefixed to tree hashes (the hash over the root list).
pub const ROOT_TYPE: u8 = 0x02;

/// BLAKE3 `derive_key` context for the discovery identifier.
pub const DISCOVERY_CONTEXT: &str = "strata 2026-01-01 discovery key v1";

/// BLAKE3 `derive_key` context for the digest the writer signs.
pub const SIGNATURE_CONTEXT: &str = "strata 2026-01-01 tree signature v1";

/// Hash output length in bytes.
pub const HASH_OUTPUT_LENGTH: usize = 32;

// ---------------------------------------------------------------------------
// Sizes
// ---------------------------------------------------------------------------

/// Largest block the writer accepts and the replicator serves.
pub const MAX_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Largest frame accepted from the wire. Must fit one maximal block plus
/// its proof and upgrade.
pub const MAX_FRAME_SIZE: u32 = 8 * 1024 * 1024;

/// Bits per persisted bitfield page. 32768 bits = 4 KiB per page.
pub const BITFIELD_PAGE_BITS: u64 = 32_768;

/// Bytes per persisted bitfield page.
pub const BITFIELD_PAGE_BYTES: usize = (BITFIELD_PAGE_BITS / 8) as usize;

/// Upper bound on tree depth and on the number of siblings in a proof.
/// Flat indices of nodes one level above this still fit in a `u64`.
pub const MAX_TREE_DEPTH: u32 = 62;

/// Longest log a tree will describe. Every root of such a log sits below
/// [`MAX_TREE_DEPTH`], and lengths claimed by peers are capped here.
pub const MAX_LOG_LENGTH: u64 = 1 << 61;

// ---------------------------------------------------------------------------
// Replication
// ---------------------------------------------------------------------------

/// Outstanding requests one peer may have from us at any time.
pub const MAX_INFLIGHT_PER_PEER: usize = 16;

/// Verification failures after which a peer is disconnected.
pub const MAX_PEER_PENALTIES: u32 = 3;

/// Blocks a parallel range download keeps in flight across all peers.
pub const DEFAULT_RANGE_PARALLELISM: usize = 32;

/// How often an active peer re-announces its length and fork.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// How long a handshake may take before the connection is dropped.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the per-connection outbound frame queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Maximum `Have` runs sent in reply to a single `WantRange`.
pub const MAX_HAVE_RUNS: usize = 4096;

/// Longest run one `Have` may claim. Senders split longer runs; a peer
/// claiming more in one message is dropped.
pub const MAX_HAVE_LENGTH: u64 = 64 * BITFIELD_PAGE_BITS;

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Name of the lock file held while a writable log is open.
pub const WRITER_LOCK_FILE: &str = "WRITER.lock";

/// Directory (inside the log directory) holding the sled database.
pub const DB_DIR: &str = "db";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_tags_are_distinct() {
        assert_ne!(LEAF_TYPE, PARENT_TYPE);
        assert_ne!(PARENT_TYPE, ROOT_TYPE);
        assert_ne!(LEAF_TYPE, ROOT_TYPE);
    }

    #[test]
    fn contexts_are_distinct() {
        assert_ne!(DISCOVERY_CONTEXT, SIGNATURE_CONTEXT);
    }

    #[test]
    fn frame_fits_a_maximal_block() {
        assert!(MAX_FRAME_SIZE as usize > MAX_BLOCK_SIZE);
    }

    #[test]
    fn bitfield_page_is_byte_aligned() {
        assert_eq!(BITFIELD_PAGE_BITS % 8, 0);
        assert_eq!(BITFIELD_PAGE_BYTES * 8, BITFIELD_PAGE_BITS as usize);
    }

    #[test]
    fn longest_log_fits_the_deepest_tree() {
        assert!(MAX_LOG_LENGTH.trailing_zeros() < MAX_TREE_DEPTH);
        assert!(MAX_HAVE_LENGTH < MAX_LOG_LENGTH);
        assert_eq!(MAX_HAVE_LENGTH % BITFIELD_PAGE_BITS, 0);
    }
}
