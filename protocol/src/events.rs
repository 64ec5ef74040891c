//! Notifications published by a log.
//!
//! Every [`crate::log::Log`] owns one `tokio::sync::broadcast` channel of
//! [`LogEvent`]s. Subscribers that fall behind lose the oldest events
//! (`RecvError::Lagged`) rather than slowing the log down.

use bytes::Bytes;

/// Identifier of one peer connection, unique within a process.
pub type PeerId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// Local blocks were appended; the log now has `length` blocks.
    Append { length: u64, byte_length: u64 },
    /// The log shrank to `length` blocks and moved to `fork`.
    Truncate { length: u64, fork: u64 },
    /// A peer offered a verified tree on a newer fork that rewrites blocks
    /// at or above `fork_point`. Nothing changes until it is applied.
    Reorg { fork: u64, fork_point: u64 },
    /// A longer tree on the same fork was verified and adopted.
    Upgrade { length: u64, fork: u64 },
    /// A block was downloaded from `peer` and verified.
    Download { index: u64, bytes: Bytes, peer: PeerId },
    PeerAdd { peer: PeerId },
    PeerRemove { peer: PeerId },
}
