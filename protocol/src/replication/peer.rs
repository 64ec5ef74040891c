//! # Peers
//!
//! One [`PeerState`] per remote end of a log channel, owned by the
//! replicator's peer table and destroyed on disconnect. The session task in
//! this module drives a peer through its lifecycle:
//!
//! ```text
//! Connecting -> Handshaking -> Active -> Closing
//! ```
//!
//! - **Connecting**: registered with the replicator, nothing sent yet.
//! - **Handshaking**: both sides send `Handshake` immediately; the remote's
//!   must arrive within the handshake timeout and name the same protocol,
//!   wire version and discovery key.
//! - **Active**: requests flow both ways, with a periodic `Announce`.
//! - **Closing**: the peer was dropped for misbehaviour or the stream
//!   ended; its outstanding requests move to other peers.
//!
//! A closed peer leaves the table, so no snapshot ever shows one.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::framing::{Frame, WireError};
use super::messages::Message;
use crate::config::{PROTOCOL_NAME, WIRE_PROTOCOL_VERSION};
use crate::crypto::Hash;
use crate::error::{LogError, LogResult};
use crate::events::PeerId;
use crate::log::Shared;
use crate::storage::Bitfield;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_peer_id() -> PeerId {
    NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle phase of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerPhase {
    Connecting,
    Handshaking,
    Active,
    Closing,
}

/// Public snapshot of one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub phase: PeerPhase,
    pub remote_length: u64,
    pub remote_byte_length: u64,
    pub remote_fork: u64,
    pub penalties: u32,
    pub inflight: usize,
    pub capabilities: Vec<String>,
}

// ---------------------------------------------------------------------------
// Outbound queue
// ---------------------------------------------------------------------------

/// Handle for queueing messages to one peer on one channel.
#[derive(Debug, Clone)]
pub(crate) struct PeerSender {
    channel: Hash,
    tx: mpsc::Sender<Frame>,
}

impl PeerSender {
    pub fn new(channel: Hash, tx: mpsc::Sender<Frame>) -> Self {
        Self { channel, tx }
    }

    fn frame(&self, message: Message) -> Frame {
        Frame {
            channel: self.channel,
            message,
        }
    }

    /// Queue without waiting. Safe to call under a lock.
    pub fn try_send(&self, message: Message) -> bool {
        self.tx.try_send(self.frame(message)).is_ok()
    }

    /// Queue, waiting for room.
    pub async fn send(&self, message: Message) -> Result<(), WireError> {
        self.tx
            .send(self.frame(message))
            .await
            .map_err(|_| WireError::Closed)
    }
}

// ---------------------------------------------------------------------------
// Peer state
// ---------------------------------------------------------------------------

pub(crate) struct PeerState {
    pub id: PeerId,
    pub phase: PeerPhase,
    pub remote_length: u64,
    pub remote_byte_length: u64,
    pub remote_fork: u64,
    /// Blocks the remote claims to hold.
    pub remote_bitfield: Bitfield,
    pub outbound: PeerSender,
    pub penalties: u32,
    /// Our requests this peer has not answered yet.
    pub inflight: usize,
    /// Ranges the remote asked to hear about, as `(start, end)`.
    pub wants: Vec<(u64, u64)>,
    pub capabilities: BTreeSet<String>,
    kill: Option<oneshot::Sender<()>>,
}

impl PeerState {
    pub fn new(id: PeerId, outbound: PeerSender, kill: oneshot::Sender<()>) -> Self {
        Self {
            id,
            phase: PeerPhase::Connecting,
            remote_length: 0,
            remote_byte_length: 0,
            remote_fork: 0,
            remote_bitfield: Bitfield::in_memory(),
            outbound,
            penalties: 0,
            inflight: 0,
            wants: Vec::new(),
            capabilities: BTreeSet::new(),
            kill: Some(kill),
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase == PeerPhase::Active
    }

    pub fn wants(&self, index: u64) -> bool {
        self.wants.iter().any(|(s, e)| *s <= index && index < *e)
    }

    /// Tell the session task to drop this peer.
    pub fn disconnect(&mut self) {
        self.phase = PeerPhase::Closing;
        let _ = self.outbound.try_send(Message::Close);
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    /// The remote moved to `fork`; forget claims from `fork_point` on.
    pub fn reset_fork(&mut self, fork: u64, fork_point: u64) {
        self.remote_fork = fork;
        self.remote_length = self.remote_length.min(fork_point);
        self.remote_bitfield.clear_from(fork_point);
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            phase: self.phase,
            remote_length: self.remote_length,
            remote_byte_length: self.remote_byte_length,
            remote_fork: self.remote_fork,
            penalties: self.penalties,
            inflight: self.inflight,
            capabilities: self.capabilities.iter().cloned().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

/// Drive one peer on one channel until the stream ends or the peer is
/// dropped.
pub(crate) async fn run_session(
    shared: Arc<Shared>,
    channel: Hash,
    outbound: mpsc::Sender<Frame>,
    mut inbound: mpsc::Receiver<Message>,
) {
    let peer = next_peer_id();
    let sender = PeerSender::new(channel, outbound);
    let (kill_tx, mut kill_rx) = oneshot::channel();
    shared
        .replicator
        .register_peer(PeerState::new(peer, sender.clone(), kill_tx));
    debug!(peer, channel = %hex::encode(channel), "peer connecting");

    let result = session(&shared, peer, channel, &sender, &mut inbound, &mut kill_rx).await;
    match &result {
        Ok(()) => debug!(peer, "peer session ended"),
        Err(e) => {
            warn!(peer, error = %e, "peer session failed");
            let _ = sender.try_send(Message::Close);
        }
    }
    shared.replicator.remove_peer(&shared, peer);
}

async fn session(
    shared: &Arc<Shared>,
    peer: PeerId,
    channel: Hash,
    sender: &PeerSender,
    inbound: &mut mpsc::Receiver<Message>,
    kill: &mut oneshot::Receiver<()>,
) -> LogResult<()> {
    let config = shared.replicator.config().clone();
    shared.replicator.set_phase(peer, PeerPhase::Handshaking);
    sender
        .send(Message::Handshake {
            protocol: PROTOCOL_NAME.to_string(),
            version: WIRE_PROTOCOL_VERSION,
            discovery_key: channel,
            capabilities: shared.replicator.capabilities(),
        })
        .await?;

    let first = match tokio::time::timeout(config.handshake_timeout, inbound.recv()).await {
        Ok(Some(message)) => message,
        Ok(None) => return Ok(()),
        Err(_) => return Err(LogError::PeerProtocol("handshake timed out".into())),
    };
    let capabilities = match first {
        Message::Handshake {
            protocol,
            version,
            discovery_key,
            capabilities,
        } => {
            if protocol != PROTOCOL_NAME || version != WIRE_PROTOCOL_VERSION {
                return Err(LogError::PeerProtocol(format!(
                    "unsupported protocol {protocol} v{version}"
                )));
            }
            if discovery_key != channel {
                return Err(LogError::PeerProtocol("handshake for another log".into()));
            }
            capabilities
        }
        Message::Close => return Ok(()),
        other => {
            return Err(LogError::PeerProtocol(format!(
                "expected handshake, got {}",
                other.kind()
            )))
        }
    };

    shared.replicator.activate(shared, peer, capabilities).await?;
    info!(peer, "peer active");

    let mut announce = tokio::time::interval(config.announce_interval);
    announce.tick().await;
    loop {
        tokio::select! {
            message = inbound.recv() => match message {
                None | Some(Message::Close) => return Ok(()),
                Some(message) => shared.replicator.handle(shared, peer, sender, message).await?,
            },
            _ = announce.tick() => {
                let local = shared.core.lock().state();
                sender.send(Message::Announce {
                    length: local.length,
                    byte_length: local.byte_length,
                    fork: local.fork,
                }).await?;
            }
            _ = &mut *kill => {
                return Err(LogError::PeerProtocol("peer dropped after repeated bad proofs".into()));
            }
        }
    }
}
