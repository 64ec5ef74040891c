//! Named application messages carried over a log's replication channel.
//!
//! An extension is registered on a [`crate::log::Log`] under a name. The
//! set of registered names is the log's capability list, sent in the
//! handshake and re-sent as `Options` whenever it changes. A message for an
//! extension is only sent to peers that listed the same name.

use std::sync::Arc;

use bytes::Bytes;

use crate::events::PeerId;
use crate::log::Shared;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtensionError {
    #[error("peer {0} is not connected")]
    UnknownPeer(PeerId),

    #[error("peer {peer} has not negotiated extension {name}")]
    NotNegotiated { peer: PeerId, name: String },

    #[error("outbound queue to peer {0} is full or closed")]
    QueueFull(PeerId),
}

/// Receives messages for one extension.
pub trait ExtensionHandler: Send + Sync + 'static {
    fn on_message(&self, peer: PeerId, payload: Bytes);

    /// A broadcast could not be delivered to `peer`.
    fn on_error(&self, _peer: PeerId, _error: ExtensionError) {}
}

/// Sending side of a registered extension.
#[derive(Clone)]
pub struct Extension {
    name: String,
    shared: Arc<Shared>,
}

impl Extension {
    pub(crate) fn new(name: String, shared: Arc<Shared>) -> Self {
        Self { name, shared }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send to one peer.
    pub fn send(&self, peer: PeerId, payload: impl Into<Bytes>) -> Result<(), ExtensionError> {
        self.shared
            .replicator
            .send_extension(peer, &self.name, payload.into())
    }

    /// Send to every peer that negotiated this extension. Returns how many
    /// peers the message was queued for.
    pub fn broadcast(&self, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let mut sent = 0;
        for peer in self.peers() {
            match self.shared.replicator.send_extension(peer, &self.name, payload.clone()) {
                Ok(()) => sent += 1,
                Err(error) => {
                    if let Some(handler) = self.shared.replicator.extension_handler(&self.name) {
                        handler.on_error(peer, error);
                    }
                }
            }
        }
        sent
    }

    /// Connected peers that negotiated this extension.
    pub fn peers(&self) -> Vec<PeerId> {
        self.shared.replicator.peers_with_capability(&self.name)
    }
}

impl std::fmt::Debug for Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extension").field("name", &self.name).finish()
    }
}
