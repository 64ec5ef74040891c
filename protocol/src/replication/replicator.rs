//! # Replicator
//!
//! Owns every peer of one log and every request the log has outstanding.
//! Session tasks hand it inbound messages; it verifies responses through the
//! log core, serves the remote's requests, and decides which peer answers
//! which request.
//!
//! ## Locking
//!
//! Two `parking_lot` mutexes are involved: the log core and the replicator
//! state. They are never held together. Every path that needs both reads
//! the core's [`LocalState`] first, releases it, then locks the state.
//! Neither is held across an `.await`: messages queued while the state lock
//! is held use the non-blocking `try_send`.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use super::extension::{ExtensionError, ExtensionHandler};
use super::messages::{Message, RequestId};
use super::peer::{PeerInfo, PeerPhase, PeerSender, PeerState};
use super::requests::{Answer, Assignment, Failure, RequestKey, RequestTable, Resolved};
use super::ReplicationConfig;
use crate::config::{MAX_HAVE_LENGTH, MAX_HAVE_RUNS, MAX_LOG_LENGTH};
use crate::error::{LogError, LogResult};
use crate::events::{LogEvent, PeerId};
use crate::log::{LocalState, Received, Shared, UpgradeOutcome};
use crate::tree::{BlockProof, Node, TreeError, UpgradeProof};

pub(crate) struct Replicator {
    config: ReplicationConfig,
    state: Mutex<ReplicatorState>,
    next_request: AtomicU64,
}

#[derive(Default)]
struct ReplicatorState {
    peers: BTreeMap<PeerId, PeerState>,
    requests: RequestTable,
    extensions: BTreeMap<String, Arc<dyn ExtensionHandler>>,
}

impl ReplicatorState {
    fn active(&self) -> impl Iterator<Item = &PeerState> {
        self.peers.values().filter(|p| p.is_active())
    }

    fn unload(&mut self, peer: PeerId) {
        if let Some(p) = self.peers.get_mut(&peer) {
            p.inflight = p.inflight.saturating_sub(1);
        }
    }

    fn finish(&mut self, key: RequestKey, answer: Answer) {
        if let Some(peer) = self.requests.resolve(key, answer) {
            self.unload(peer);
        }
    }

    fn release(&mut self, key: RequestKey, tried: bool) {
        if let Some(peer) = self.requests.release(key, tried) {
            self.unload(peer);
        }
    }

    fn penalize(&mut self, peer: PeerId, max: u32) {
        let Some(p) = self.peers.get_mut(&peer) else {
            return;
        };
        p.penalties += 1;
        if p.penalties >= max {
            warn!(peer, penalties = p.penalties, "disconnecting misbehaving peer");
            p.disconnect();
        }
    }

    fn announce(&self, local: LocalState) {
        for peer in self.active() {
            peer.outbound.try_send(Message::Announce {
                length: local.length,
                byte_length: local.byte_length,
                fork: local.fork,
            });
        }
    }

    /// Best peer for `key` that has not been tried and has capacity.
    fn pick(
        &self,
        key: RequestKey,
        tried: &HashSet<PeerId>,
        local: LocalState,
        max_inflight: usize,
    ) -> Option<PeerId> {
        let mut candidates = self
            .active()
            .filter(|p| !tried.contains(&p.id) && p.inflight < max_inflight && eligible(p, key, local));
        let best = match key {
            RequestKey::Upgrade => candidates.min_by_key(|p| {
                (Reverse(p.remote_fork), Reverse(p.remote_length), p.penalties, p.inflight, p.id)
            }),
            _ => candidates.min_by_key(|p| (p.penalties, p.inflight, p.id)),
        };
        best.map(|p| p.id)
    }
}

/// Whether `peer` can plausibly answer `key` for a requester at `local`.
fn eligible(peer: &PeerState, key: RequestKey, local: LocalState) -> bool {
    let same_tree = peer.remote_fork == local.fork && peer.remote_length >= local.length;
    match key {
        RequestKey::Block(index) => {
            same_tree && peer.remote_length > index && peer.remote_bitfield.get(index)
        }
        RequestKey::Range { start, end } => {
            same_tree
                && peer.remote_length >= end
                && peer.remote_bitfield.first_unset(start, end).is_none()
        }
        RequestKey::Seek(_) => same_tree && local.length > 0,
        RequestKey::Upgrade => true,
    }
}

fn request_message(key: RequestKey, id: RequestId, local: LocalState) -> Message {
    let (fork, length) = (local.fork, local.length);
    match key {
        RequestKey::Block(index) => Message::RequestBlock { id, index, fork, length },
        RequestKey::Range { start, end } => Message::RequestRange {
            id,
            start,
            end,
            fork,
            length,
        },
        RequestKey::Seek(byte_offset) => Message::RequestSeek {
            id,
            byte_offset,
            fork,
            length,
        },
        RequestKey::Upgrade => Message::RequestUpgrade { id, fork, length },
    }
}

/// `Have` messages covering `[start, start + length)`, split to the
/// per-message limit.
fn have_messages(start: u64, length: u64) -> impl Iterator<Item = Message> {
    let end = start.saturating_add(length);
    (start..end)
        .step_by(MAX_HAVE_LENGTH as usize)
        .map(move |s| Message::Have {
            start: s,
            length: (end - s).min(MAX_HAVE_LENGTH),
        })
}

/// A caller's interest in one request. Dropping it (answer received,
/// timeout, or the caller's future cancelled) withdraws the request if no
/// other caller is still waiting.
struct Waiting<'a> {
    replicator: &'a Replicator,
    key: RequestKey,
    rx: oneshot::Receiver<Answer>,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.rx.close();
        self.replicator.drop_orphans(self.key);
    }
}

impl Replicator {
    pub fn new(config: ReplicationConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ReplicatorState::default()),
            next_request: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Names of registered extensions, sent in handshakes.
    pub fn capabilities(&self) -> Vec<String> {
        self.state.lock().extensions.keys().cloned().collect()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.state.lock().peers.values().map(PeerState::info).collect()
    }

    // -----------------------------------------------------------------------
    // Peer lifecycle
    // -----------------------------------------------------------------------

    pub fn register_peer(&self, peer: PeerState) {
        self.state.lock().peers.insert(peer.id, peer);
    }

    pub fn set_phase(&self, peer: PeerId, phase: PeerPhase) {
        if let Some(p) = self.state.lock().peers.get_mut(&peer) {
            trace!(peer, from = ?p.phase, to = ?phase, "peer phase");
            p.phase = phase;
        }
    }

    /// Handshake accepted: announce our tree and what we hold.
    pub async fn activate(&self, shared: &Shared, peer: PeerId, capabilities: Vec<String>) -> LogResult<()> {
        let (local, runs) = {
            let core = shared.core.lock();
            let local = core.state();
            (local, core.bitfield().runs(0, local.length))
        };
        let sender = {
            let mut state = self.state.lock();
            let Some(p) = state.peers.get_mut(&peer) else {
                return Ok(());
            };
            p.phase = PeerPhase::Active;
            p.capabilities = capabilities.into_iter().collect();
            p.outbound.clone()
        };
        let _ = shared.events.send(LogEvent::PeerAdd { peer });

        sender
            .send(Message::Announce {
                length: local.length,
                byte_length: local.byte_length,
                fork: local.fork,
            })
            .await?;
        for (start, length) in runs.into_iter().take(MAX_HAVE_RUNS) {
            for message in have_messages(start, length) {
                sender.send(message).await?;
            }
        }
        self.redispatch_parked(shared);
        Ok(())
    }

    /// Forget `peer` and move its requests elsewhere.
    pub fn remove_peer(&self, shared: &Shared, peer: PeerId) {
        let was_active = {
            let mut state = self.state.lock();
            let held = state.requests.assigned_to(peer);
            for key in held {
                state.release(key, true);
            }
            state
                .peers
                .remove(&peer)
                .map_or(false, |p| matches!(p.phase, PeerPhase::Active | PeerPhase::Closing))
        };
        if was_active {
            info!(peer, "peer removed");
            let _ = shared.events.send(LogEvent::PeerRemove { peer });
        }
        self.redispatch_parked(shared);
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// Ask the network for `key`, sharing any identical request in flight.
    ///
    /// Block, seek and upgrade requests wait for a capable peer. A bulk range
    /// request fails at once when no single peer claims the whole range.
    pub async fn request(&self, shared: &Shared, key: RequestKey, timeout: Option<Duration>) -> LogResult<Resolved> {
        let park = !matches!(key, RequestKey::Range { .. });
        let (tx, rx) = oneshot::channel();
        let created = self.state.lock().requests.join(key, Some(tx), park);
        if created {
            self.dispatch(shared, key);
        }
        let mut waiting = Waiting {
            replicator: self,
            key,
            rx,
        };
        let answer = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut waiting.rx).await {
                Ok(answer) => answer,
                Err(_) => return Err(LogError::Unavailable(format!("{key:?} timed out"))),
            },
            None => (&mut waiting.rx).await,
        };
        match answer {
            Ok(Ok(resolved)) => Ok(resolved),
            Ok(Err(failure)) => Err(failure.into()),
            Err(_) => Err(LogError::Cancelled),
        }
    }

    /// Ask for a newer signed tree without anyone waiting on the answer.
    fn background_upgrade(&self, shared: &Shared) {
        let created = self.state.lock().requests.join(RequestKey::Upgrade, None, false);
        if created {
            self.dispatch(shared, RequestKey::Upgrade);
        }
    }

    pub fn dispatch(&self, shared: &Shared, key: RequestKey) {
        let local = shared.core.lock().state();
        let mut state = self.state.lock();
        self.dispatch_locked(&mut state, key, local);
    }

    fn dispatch_locked(&self, state: &mut ReplicatorState, key: RequestKey, local: LocalState) {
        loop {
            let Some(pending) = state.requests.get(&key) else {
                return;
            };
            if pending.assigned.is_some() {
                return;
            }
            let picked = state.pick(key, &pending.tried, local, self.config.max_inflight_per_peer);
            let Some(peer_id) = picked else {
                let park = pending.park;
                let tried_any = !pending.tried.is_empty();
                match key {
                    RequestKey::Upgrade if tried_any => {
                        state.finish(key, Ok(Resolved::Upgrade(UpgradeOutcome::Unchanged)));
                    }
                    _ if !park => {
                        state.finish(key, Err(Failure::Unavailable(format!("no peer can serve {key:?}"))));
                    }
                    _ => trace!(?key, "request parked"),
                }
                return;
            };

            let id = self.next_request.fetch_add(1, Ordering::Relaxed);
            let Some(peer) = state.peers.get_mut(&peer_id) else {
                return;
            };
            if peer.outbound.try_send(request_message(key, id, local)) {
                peer.inflight += 1;
                trace!(?key, peer = peer_id, id, "request sent");
                state.requests.assign(
                    key,
                    Assignment {
                        peer: peer_id,
                        id,
                        fork: local.fork,
                        length: local.length,
                    },
                );
                return;
            }
            if let Some(pending) = state.requests.get_mut(&key) {
                pending.tried.insert(peer_id);
            }
        }
    }

    /// Re-examine every request that has no peer.
    pub fn redispatch_parked(&self, shared: &Shared) {
        let local = shared.core.lock().state();
        let mut state = self.state.lock();
        let parked = state.requests.parked();
        for key in parked {
            self.dispatch_locked(&mut state, key, local);
        }
    }

    fn drop_orphans(&self, key: RequestKey) {
        let mut state = self.state.lock();
        if let Some(Some(peer)) = state.requests.drop_abandoned(key) {
            state.unload(peer);
        }
    }

    /// Drop the peer's answer to `key`, penalize it, and try someone else.
    fn fault(&self, shared: &Shared, peer: PeerId, key: RequestKey, reason: &str) {
        warn!(peer, ?key, reason, "peer sent an invalid response");
        let local = shared.core.lock().state();
        let mut state = self.state.lock();
        state.release(key, true);
        state.penalize(peer, self.config.max_penalties);
        self.dispatch_locked(&mut state, key, local);
    }

    /// The peer declined or could not help; try someone else.
    fn retry(&self, shared: &Shared, key: RequestKey, tried: bool) {
        let local = shared.core.lock().state();
        let mut state = self.state.lock();
        state.release(key, tried);
        self.dispatch_locked(&mut state, key, local);
    }

    fn fail(&self, key: RequestKey, error: &LogError) {
        error!(?key, %error, "request failed locally");
        self.state
            .lock()
            .finish(key, Err(Failure::Unavailable(error.to_string())));
    }

    /// The local tree grew or changed fork: tell peers and retry parked work.
    fn after_upgrade(&self, shared: &Shared) {
        let local = shared.core.lock().state();
        self.state.lock().announce(local);
        self.redispatch_parked(shared);
    }

    // -----------------------------------------------------------------------
    // Local changes
    // -----------------------------------------------------------------------

    pub fn on_local_append(&self, old_length: u64, now: LocalState) {
        let state = self.state.lock();
        state.announce(now);
        for peer in state.active() {
            for message in have_messages(old_length, now.length - old_length) {
                peer.outbound.try_send(message);
            }
        }
    }

    pub fn on_local_truncate(&self, now: LocalState) {
        let state = self.state.lock();
        for peer in state.active() {
            peer.outbound.try_send(Message::Reorg {
                fork: now.fork,
                fork_point: now.length,
            });
        }
        state.announce(now);
    }

    /// A parked reorg was applied locally.
    pub fn on_reorg_applied(&self, shared: &Shared) {
        self.after_upgrade(shared);
    }

    pub fn send_want(&self, start: u64, length: u64) {
        for peer in self.state.lock().active() {
            peer.outbound.try_send(Message::WantRange { start, length });
        }
    }

    pub fn cancel_want(&self, start: u64, length: u64) {
        for peer in self.state.lock().active() {
            peer.outbound.try_send(Message::CancelWant { start, length });
        }
    }

    // -----------------------------------------------------------------------
    // Extensions
    // -----------------------------------------------------------------------

    pub fn register_extension(&self, name: String, handler: Arc<dyn ExtensionHandler>) {
        let mut state = self.state.lock();
        state.extensions.insert(name, handler);
        let capabilities: Vec<String> = state.extensions.keys().cloned().collect();
        for peer in state.active() {
            peer.outbound.try_send(Message::Options {
                capabilities: capabilities.clone(),
            });
        }
    }

    pub fn extension_handler(&self, name: &str) -> Option<Arc<dyn ExtensionHandler>> {
        self.state.lock().extensions.get(name).cloned()
    }

    pub fn send_extension(&self, peer: PeerId, name: &str, payload: Bytes) -> Result<(), ExtensionError> {
        let state = self.state.lock();
        let p = state
            .peers
            .get(&peer)
            .filter(|p| p.is_active())
            .ok_or(ExtensionError::UnknownPeer(peer))?;
        if !p.capabilities.contains(name) {
            return Err(ExtensionError::NotNegotiated {
                peer,
                name: name.to_string(),
            });
        }
        let sent = p.outbound.try_send(Message::ExtensionMessage {
            name: name.to_string(),
            payload,
        });
        if sent {
            Ok(())
        } else {
            Err(ExtensionError::QueueFull(peer))
        }
    }

    pub fn peers_with_capability(&self, name: &str) -> Vec<PeerId> {
        self.state
            .lock()
            .active()
            .filter(|p| p.capabilities.contains(name))
            .map(|p| p.id)
            .collect()
    }

    // -----------------------------------------------------------------------
    // Inbound messages
    // -----------------------------------------------------------------------

    /// Handle one message from an active peer. An error tears the
    /// connection down.
    pub async fn handle(
        &self,
        shared: &Arc<Shared>,
        peer: PeerId,
        sender: &PeerSender,
        message: Message,
    ) -> LogResult<()> {
        trace!(peer, kind = message.kind(), "inbound message");
        match message {
            Message::Handshake { .. } => {
                return Err(LogError::PeerProtocol("duplicate handshake".into()));
            }
            Message::Announce {
                length,
                byte_length,
                fork,
            } => self.on_announce(shared, peer, length, byte_length, fork)?,
            Message::Have { start, length } => self.on_have(shared, peer, start, length)?,
            Message::WantRange { start, length } => {
                self.on_want(shared, peer, sender, start, length).await?
            }
            Message::CancelWant { start, length } => self.on_cancel_want(peer, start, length),
            Message::RequestBlock {
                id,
                index,
                fork,
                length,
            } => serve_block(shared, sender, id, index, fork, length).await?,
            Message::RequestRange {
                id,
                start,
                end,
                fork,
                length,
            } => serve_range(shared, sender, id, start, end, fork, length).await?,
            Message::RequestUpgrade { id, fork, length } => {
                serve_upgrade(shared, sender, id, fork, length).await?
            }
            Message::RequestSeek {
                id,
                byte_offset,
                fork,
                length,
            } => serve_seek(shared, sender, id, byte_offset, fork, length).await?,
            Message::Data {
                id,
                index,
                bytes,
                proof,
                upgrade,
            } => self.on_data(shared, peer, id, index, bytes, proof, upgrade),
            Message::NoData { id } => {
                let found = self.state.lock().requests.lookup(peer, id);
                if let Some((key, _)) = found {
                    debug!(peer, ?key, "peer has no data");
                    self.retry(shared, key, true);
                }
            }
            Message::RangeEnd { id } => {
                let found = self.state.lock().requests.lookup(peer, id);
                match found {
                    Some((key @ RequestKey::Range { .. }, _)) => {
                        self.state.lock().finish(key, Ok(Resolved::Range));
                    }
                    Some((key, _)) => self.fault(shared, peer, key, "range end for a non-range request"),
                    None => {}
                }
            }
            Message::Upgrade { id, proof } => self.on_upgrade(shared, peer, id, proof),
            Message::Nodes { id, nodes } => self.on_nodes(shared, peer, id, &nodes),
            Message::Reorg { fork, fork_point } => self.on_peer_reorg(shared, peer, fork, fork_point),
            Message::Options { capabilities } => self.on_options(peer, capabilities),
            Message::ExtensionMessage { name, payload } => match self.extension_handler(&name) {
                Some(handler) => handler.on_message(peer, payload),
                None => debug!(peer, name = %name, "message for unknown extension"),
            },
            Message::Close => {}
        }
        Ok(())
    }

    fn on_announce(&self, shared: &Shared, peer: PeerId, length: u64, byte_length: u64, fork: u64) -> LogResult<()> {
        if length > MAX_LOG_LENGTH {
            return Err(LogError::PeerProtocol(format!("announced length {length} is impossible")));
        }
        let local = shared.core.lock().state();
        if let Some(p) = self.state.lock().peers.get_mut(&peer) {
            p.remote_length = length;
            p.remote_byte_length = byte_length;
            p.remote_fork = fork;
        }
        let ahead = fork > local.fork || (fork == local.fork && length > local.length);
        if ahead && shared.writer.is_none() {
            self.background_upgrade(shared);
        }
        self.redispatch_parked(shared);
        Ok(())
    }

    fn on_have(&self, shared: &Shared, peer: PeerId, start: u64, length: u64) -> LogResult<()> {
        if length > MAX_HAVE_LENGTH {
            return Err(LogError::PeerProtocol(format!(
                "have claims {length} blocks in one message"
            )));
        }
        if let Some(p) = self.state.lock().peers.get_mut(&peer) {
            // Claims past the announced length are meaningless.
            let length = length.min(p.remote_length.saturating_sub(start));
            p.remote_bitfield.set_range(start, length, true);
        }
        self.redispatch_parked(shared);
        Ok(())
    }

    async fn on_want(
        &self,
        shared: &Shared,
        peer: PeerId,
        sender: &PeerSender,
        start: u64,
        length: u64,
    ) -> LogResult<()> {
        let end = start.saturating_add(length);
        let runs = {
            let core = shared.core.lock();
            let held_end = end.min(core.state().length);
            if start < held_end {
                core.bitfield().runs(start, held_end)
            } else {
                Vec::new()
            }
        };
        if let Some(p) = self.state.lock().peers.get_mut(&peer) {
            p.wants.push((start, end));
        }
        for (start, length) in runs.into_iter().take(MAX_HAVE_RUNS) {
            for message in have_messages(start, length) {
                sender.send(message).await?;
            }
        }
        Ok(())
    }

    fn on_cancel_want(&self, peer: PeerId, start: u64, length: u64) {
        let end = start.saturating_add(length);
        if let Some(p) = self.state.lock().peers.get_mut(&peer) {
            p.wants.retain(|w| *w != (start, end));
        }
    }

    fn on_options(&self, peer: PeerId, capabilities: Vec<String>) {
        if let Some(p) = self.state.lock().peers.get_mut(&peer) {
            debug!(peer, ?capabilities, "peer updated capabilities");
            p.capabilities = capabilities.into_iter().collect();
        }
    }

    fn on_peer_reorg(&self, shared: &Shared, peer: PeerId, fork: u64, fork_point: u64) {
        let local = shared.core.lock().state();
        if let Some(p) = self.state.lock().peers.get_mut(&peer) {
            if fork > p.remote_fork {
                p.reset_fork(fork, fork_point);
            }
        }
        debug!(peer, fork, fork_point, "peer moved to a new fork");
        if fork > local.fork && shared.writer.is_none() {
            self.background_upgrade(shared);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_data(
        &self,
        shared: &Shared,
        peer: PeerId,
        id: RequestId,
        index: u64,
        bytes: Bytes,
        proof: BlockProof,
        upgrade: Option<UpgradeProof>,
    ) {
        let found = self.state.lock().requests.lookup(peer, id);
        let Some((key, assignment)) = found else {
            trace!(peer, id, index, "unsolicited data");
            return;
        };
        let answers = match key {
            RequestKey::Block(i) => i == index,
            RequestKey::Range { start, end } => start <= index && index < end,
            _ => false,
        };
        if !answers {
            self.fault(shared, peer, key, "data does not answer the request");
            return;
        }

        let shaped = upgrade.as_ref().map(|u| u.length);
        let result = shared.core.lock().receive_block(
            index,
            &bytes,
            &proof,
            upgrade,
            assignment.fork,
            assignment.length,
        );
        let stored = match result {
            Ok(Received::Stored) => {
                debug!(peer, index, size = bytes.len(), "downloaded block");
                let _ = shared.events.send(LogEvent::Download {
                    index,
                    bytes: bytes.clone(),
                    peer,
                });
                Some(bytes)
            }
            Ok(Received::Duplicate) => {
                let local = shared.core.lock().read_local(index);
                match local {
                    Ok(local) => local,
                    Err(e) => {
                        self.fail(key, &e);
                        return;
                    }
                }
            }
            Ok(Received::Stale) => {
                if let RequestKey::Block(_) = key {
                    debug!(peer, index, "response for an older tree, reissuing");
                    self.retry(shared, key, false);
                }
                return;
            }
            Err(e) if e.is_peer_fault() => {
                self.fault(shared, peer, key, &e.to_string());
                return;
            }
            Err(e) => {
                self.fail(key, &e);
                return;
            }
        };

        {
            let mut state = self.state.lock();
            if let (RequestKey::Range { .. }, Some(length)) = (key, shaped) {
                state.requests.reshape(key, length);
            }
            if let Some(bytes) = stored {
                state.finish(RequestKey::Block(index), Ok(Resolved::Block(bytes)));
            }
            for p in state.active().filter(|p| p.id != peer && p.wants(index)) {
                p.outbound.try_send(Message::Have { start: index, length: 1 });
            }
        }
        if shaped.is_some() {
            self.after_upgrade(shared);
        }
    }

    fn on_upgrade(&self, shared: &Shared, peer: PeerId, id: RequestId, proof: UpgradeProof) {
        let found = self.state.lock().requests.lookup(peer, id);
        let Some((key, _)) = found else {
            return;
        };
        if key != RequestKey::Upgrade {
            self.fault(shared, peer, key, "upgrade answers a different request");
            return;
        }
        if shared.writer.is_some() {
            self.state
                .lock()
                .finish(key, Ok(Resolved::Upgrade(UpgradeOutcome::Unchanged)));
            return;
        }

        let result = shared.core.lock().receive_upgrade(proof);
        match result {
            Ok(outcome) => {
                self.state.lock().finish(key, Ok(Resolved::Upgrade(outcome)));
                if let UpgradeOutcome::Upgraded { length, fork } = outcome {
                    debug!(peer, length, fork, "adopted peer's tree");
                    self.after_upgrade(shared);
                }
            }
            Err(LogError::Tree(TreeError::StaleFork { .. })) => self.retry(shared, key, true),
            Err(e) if e.is_peer_fault() => self.fault(shared, peer, key, &e.to_string()),
            Err(e) => self.fail(key, &e),
        }
    }

    fn on_nodes(&self, shared: &Shared, peer: PeerId, id: RequestId, nodes: &[Node]) {
        let found = self.state.lock().requests.lookup(peer, id);
        let Some((key, assignment)) = found else {
            return;
        };
        if !matches!(key, RequestKey::Seek(_)) {
            self.fault(shared, peer, key, "nodes answer a non-seek request");
            return;
        }

        let result = {
            let mut core = shared.core.lock();
            let local = core.state();
            if local.fork != assignment.fork || local.length != assignment.length {
                Ok(None)
            } else {
                core.tree_mut().add_nodes(nodes).map(Some).map_err(LogError::from)
            }
        };
        match result {
            Ok(None) => self.retry(shared, key, false),
            Ok(Some(0)) => self.retry(shared, key, true),
            Ok(Some(added)) => {
                trace!(peer, added, "stored seek nodes");
                self.state.lock().finish(key, Ok(Resolved::Nodes));
            }
            Err(e) if e.is_peer_fault() => self.fault(shared, peer, key, &e.to_string()),
            Err(e) => self.fail(key, &e),
        }
    }
}

// ---------------------------------------------------------------------------
// Serving
// ---------------------------------------------------------------------------

async fn serve_block(
    shared: &Shared,
    sender: &PeerSender,
    id: RequestId,
    index: u64,
    fork: u64,
    length: u64,
) -> LogResult<()> {
    let served = shared.core.lock().serve_block(index, fork, length);
    let reply = match served {
        Ok(Some((bytes, proof, upgrade))) => Message::Data {
            id,
            index,
            bytes,
            proof,
            upgrade,
        },
        Ok(None) => Message::NoData { id },
        Err(e) => {
            warn!(index, error = %e, "failed to serve block");
            Message::NoData { id }
        }
    };
    sender.send(reply).await?;
    Ok(())
}

/// One `Data` per held block in `[start, end)`, then `RangeEnd`. Only the
/// first block carries an upgrade; later proofs are shaped for the tree
/// that upgrade describes.
async fn serve_range(
    shared: &Shared,
    sender: &PeerSender,
    id: RequestId,
    start: u64,
    end: u64,
    fork: u64,
    length: u64,
) -> LogResult<()> {
    let end = end.min(shared.core.lock().state().length);
    let mut shaped = length;
    for index in start..end {
        let served = shared.core.lock().serve_block(index, fork, shaped);
        match served {
            Ok(Some((bytes, proof, upgrade))) => {
                if let Some(u) = &upgrade {
                    shaped = u.length;
                }
                sender
                    .send(Message::Data {
                        id,
                        index,
                        bytes,
                        proof,
                        upgrade,
                    })
                    .await?;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(index, error = %e, "range serve stopped");
                break;
            }
        }
    }
    sender.send(Message::RangeEnd { id }).await?;
    Ok(())
}

async fn serve_upgrade(shared: &Shared, sender: &PeerSender, id: RequestId, fork: u64, length: u64) -> LogResult<()> {
    let served = shared.core.lock().serve_upgrade(fork, length);
    let reply = match served {
        Ok(Some(proof)) => Message::Upgrade { id, proof },
        Ok(None) => Message::NoData { id },
        Err(e) => {
            warn!(error = %e, "failed to serve upgrade");
            Message::NoData { id }
        }
    };
    sender.send(reply).await?;
    Ok(())
}

async fn serve_seek(
    shared: &Shared,
    sender: &PeerSender,
    id: RequestId,
    byte_offset: u64,
    fork: u64,
    length: u64,
) -> LogResult<()> {
    let nodes = {
        let core = shared.core.lock();
        let local = core.state();
        if fork != local.fork || local.length < length || length == 0 {
            None
        } else {
            core.tree().seek_proof(byte_offset, length).ok()
        }
    };
    let reply = match nodes {
        Some(nodes) => Message::Nodes { id, nodes },
        None => Message::NoData { id },
    };
    sender.send(reply).await?;
    Ok(())
}
