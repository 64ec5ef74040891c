//! # Wire Messages
//!
//! Every message two peers exchange about one log. Messages travel inside a
//! [`super::framing::Frame`] tagged with the log's discovery key, so several
//! logs can share one connection.
//!
//! ```text
//! Reader                                   Writer
//! ──────                                   ──────
//!   │  Handshake { discovery_key, caps }     │
//!   │<─────────────────────────────────────> │
//!   │  Announce { length, fork }  + Have     │
//!   │<────────────────────────────────────── │
//!   │  RequestBlock { id, index, length }    │
//!   │──────────────────────────────────────> │
//!   │  Data { id, bytes, proof, upgrade? }   │
//!   │<────────────────────────────────────── │
//! ```
//!
//! Requests carry a connection-local `id`; the matching response echoes it.
//! Requests also carry the requester's `(fork, length)` so the responder can
//! shape its proof against the tree the requester actually trusts.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::crypto::Hash;
use crate::tree::{BlockProof, Node, UpgradeProof};

/// Request identifier, unique per connection and direction.
pub type RequestId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// First message on a channel. `discovery_key` must match the channel.
    Handshake {
        protocol: String,
        version: u16,
        discovery_key: Hash,
        capabilities: Vec<String>,
    },

    /// The sender's current tree.
    Announce { length: u64, byte_length: u64, fork: u64 },

    /// The sender holds blocks `[start, start + length)`.
    Have { start: u64, length: u64 },

    /// Ask to be told about blocks in `[start, start + length)`.
    WantRange { start: u64, length: u64 },

    CancelWant { start: u64, length: u64 },

    RequestBlock {
        id: RequestId,
        index: u64,
        fork: u64,
        length: u64,
    },

    /// One verified-at-source block. `upgrade` is present when the sender's
    /// tree is longer than the requester's, and `proof` is relative to it.
    Data {
        id: RequestId,
        index: u64,
        bytes: Bytes,
        proof: BlockProof,
        upgrade: Option<UpgradeProof>,
    },

    /// The request cannot be answered by this peer.
    NoData { id: RequestId },

    /// Blocks `[start, end)`; answered by a `Data` per held block, then
    /// `RangeEnd`.
    RequestRange {
        id: RequestId,
        start: u64,
        end: u64,
        fork: u64,
        length: u64,
    },

    RangeEnd { id: RequestId },

    RequestUpgrade { id: RequestId, fork: u64, length: u64 },

    Upgrade { id: RequestId, proof: UpgradeProof },

    /// Ask for the nodes that locate `byte_offset` in a tree of `length`.
    RequestSeek {
        id: RequestId,
        byte_offset: u64,
        fork: u64,
        length: u64,
    },

    /// Child pairs, top-down, along a seek path.
    Nodes { id: RequestId, nodes: Vec<Node> },

    /// The sender moved to `fork`; blocks from `fork_point` on changed.
    Reorg { fork: u64, fork_point: u64 },

    /// Updated capability list.
    Options { capabilities: Vec<String> },

    ExtensionMessage { name: String, payload: Bytes },

    Close,
}

impl Message {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake { .. } => "handshake",
            Message::Announce { .. } => "announce",
            Message::Have { .. } => "have",
            Message::WantRange { .. } => "want-range",
            Message::CancelWant { .. } => "cancel-want",
            Message::RequestBlock { .. } => "request-block",
            Message::Data { .. } => "data",
            Message::NoData { .. } => "no-data",
            Message::RequestRange { .. } => "request-range",
            Message::RangeEnd { .. } => "range-end",
            Message::RequestUpgrade { .. } => "request-upgrade",
            Message::Upgrade { .. } => "upgrade",
            Message::RequestSeek { .. } => "request-seek",
            Message::Nodes { .. } => "nodes",
            Message::Reorg { .. } => "reorg",
            Message::Options { .. } => "options",
            Message::ExtensionMessage { .. } => "extension",
            Message::Close => "close",
        }
    }

    /// The request id a response answers, if this is a response.
    pub fn response_id(&self) -> Option<RequestId> {
        match self {
            Message::Data { id, .. }
            | Message::NoData { id }
            | Message::RangeEnd { id }
            | Message::Upgrade { id, .. }
            | Message::Nodes { id, .. } => Some(*id),
            _ => None,
        }
    }
}
