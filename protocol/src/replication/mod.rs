//! # Replication
//!
//! The peer wire protocol for one or more logs over any duplex byte stream.
//!
//! ```text
//! framing.rs    - u32 length prefix + bincode frames, tagged by channel
//! messages.rs   - every message kind peers exchange
//! mux.rs        - one physical stream, many logs, routed by discovery key
//! peer.rs       - per-peer state machine and session task
//! requests.rs   - pending requests keyed by (kind, target), waiters, retry
//! replicator.rs - dispatch, serving, verification of responses
//! range.rs      - cancellable range downloads
//! extension.rs  - named application messages over the same channel
//! ```
//!
//! ## Design Decisions
//!
//! - **Nothing unverified touches storage.** Every `Data`, `Upgrade` and
//!   `Nodes` response is checked against the tree current at the moment it
//!   arrives. A response shaped for a tree we no longer have is dropped and
//!   the request re-issued; only a response that fails verification against
//!   the tree it was shaped for costs the peer a penalty.
//! - **Requests outlive peers.** A pending request is keyed by what it asks
//!   for, not by who it asked. When its peer disconnects or fails, the
//!   request moves to the next candidate, or is parked until one appears.
//! - **Reorgs are never automatic.** A verified tree on a newer fork that
//!   would discard local blocks is parked as a notice; the application
//!   decides when to apply it.
//! - **Transport is the caller's problem.** [`Mux`] accepts anything that is
//!   `AsyncRead + AsyncWrite`: a TCP stream, a `tokio::io::duplex` pair in
//!   tests, or an encrypted stream from a higher layer.

pub mod extension;
pub mod framing;
pub mod messages;
pub mod mux;
pub mod peer;
pub mod range;
pub(crate) mod replicator;
pub mod requests;

use std::time::Duration;

pub use extension::{Extension, ExtensionError, ExtensionHandler};
pub use framing::{encode_frame, read_frame, write_frame, Frame, WireError};
pub use messages::{Message, RequestId};
pub use mux::Mux;
pub use peer::{PeerInfo, PeerPhase};
pub use range::{RangeHandle, RangeSummary};
pub use requests::RequestKey;

use crate::config::{
    ANNOUNCE_INTERVAL, DEFAULT_RANGE_PARALLELISM, HANDSHAKE_TIMEOUT, MAX_INFLIGHT_PER_PEER,
    MAX_PEER_PENALTIES,
};

/// Tuning knobs for replication.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Requests one peer may have outstanding from us at once.
    pub max_inflight_per_peer: usize,

    /// Failed verifications after which a peer is disconnected.
    pub max_penalties: u32,

    /// Default timeout for `get`, `seek` and range downloads. `None` parks
    /// requests until a peer can answer or the caller gives up.
    pub request_timeout: Option<Duration>,

    /// Concurrent block requests of one non-linear range download.
    pub range_parallelism: usize,

    pub announce_interval: Duration,

    pub handshake_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_inflight_per_peer: MAX_INFLIGHT_PER_PEER,
            max_penalties: MAX_PEER_PENALTIES,
            request_timeout: None,
            range_parallelism: DEFAULT_RANGE_PARALLELISM,
            announce_interval: ANNOUNCE_INTERVAL,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}
