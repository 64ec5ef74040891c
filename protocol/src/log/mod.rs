//! # Log
//!
//! The public face of one log. A [`Log`] is a cheap, cloneable handle; all
//! clones share one core, one writer queue, and one replicator.
//!
//! ```text
//!            Log (Arc<Shared>)
//!   ┌─────────────┼──────────────────┐
//!   │             │                  │
//! Writer     Mutex<Core>        Replicator
//! (async     tree, bitfield,    peers, pending requests,
//!  queue)    block store, info  extensions
//! ```
//!
//! Reads try local storage first and fall back to the network. Writes are
//! only possible on the copy holding the secret key; every other copy
//! verifies what it downloads against the writer's signed tree.

mod core;
mod writer;

pub use self::core::{LocalState, Received, ReorgNotice, Served, UpgradeOutcome};
pub(crate) use self::core::Core;
pub(crate) use self::writer::Writer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::EVENT_CHANNEL_CAPACITY;
use crate::crypto::keys::PublicKey;
use crate::crypto::Hash;
use crate::error::{LogError, LogResult};
use crate::events::LogEvent;
use crate::replication::replicator::Replicator;
use crate::replication::requests::{RequestKey, Resolved};
use crate::replication::{
    Extension, ExtensionHandler, Mux, PeerInfo, RangeHandle, ReplicationConfig,
};
use crate::storage::{Identity, Storage};
use crate::tree::{BlockProof, SeekOutcome, SeekResolver, UpgradeProof};

/// State shared by every clone of a [`Log`] and by its replication tasks.
pub(crate) struct Shared {
    pub core: Mutex<Core>,
    pub writer: Option<Writer>,
    pub replicator: Replicator,
    pub events: broadcast::Sender<LogEvent>,
    pub public_key: PublicKey,
    pub discovery_key: Hash,
}

impl Shared {
    /// A block from local storage, or from the network if it is not held.
    pub async fn fetch_block(&self, index: u64, timeout: Option<Duration>) -> LogResult<Bytes> {
        let local = {
            let core = self.core.lock();
            if let Some(notice) = core.pending_reorg() {
                if index >= notice.fork_point {
                    return Err(LogError::ReorgPending {
                        fork: notice.fork,
                        fork_point: notice.fork_point,
                    });
                }
            }
            match core.read_local(index)? {
                Some(bytes) => return Ok(bytes),
                None => core.state(),
            }
        };
        if self.writer.is_some() {
            return Err(LogError::OutOfBounds {
                index,
                length: local.length,
            });
        }

        match self.replicator.request(self, RequestKey::Block(index), timeout).await? {
            Resolved::Block(bytes) => Ok(bytes),
            other => Err(LogError::Unavailable(format!(
                "block {index} answered with {other:?}"
            ))),
        }
    }

    async fn request_upgrade(&self, timeout: Option<Duration>) -> LogResult<UpgradeOutcome> {
        if self.writer.is_some() {
            return Ok(UpgradeOutcome::Unchanged);
        }
        match self.replicator.request(self, RequestKey::Upgrade, timeout).await? {
            Resolved::Upgrade(outcome) => Ok(outcome),
            other => Err(LogError::Unavailable(format!("upgrade answered with {other:?}"))),
        }
    }
}

/// How to open a [`Log`].
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub storage: Storage,
    /// `None` opens whatever identity is stored, or creates a new writable
    /// log if nothing is.
    pub identity: Option<Identity>,
    pub replication: ReplicationConfig,
}

impl LogOptions {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            identity: None,
            replication: ReplicationConfig::default(),
        }
    }

    /// In-memory storage.
    pub fn temporary() -> Self {
        Self::new(Storage::Temporary)
    }

    pub fn dir<P: Into<PathBuf>>(path: P) -> Self {
        Self::new(Storage::dir(path))
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Open as a reader of the log with `public_key`.
    pub fn reader_of(self, public_key: PublicKey) -> Self {
        self.with_identity(Identity::ReadOnly(public_key))
    }

    pub fn with_replication(mut self, replication: ReplicationConfig) -> Self {
        self.replication = replication;
        self
    }
}

/// Snapshot of a log for tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogStatus {
    pub public_key: String,
    pub discovery_key: String,
    pub writable: bool,
    pub length: u64,
    pub byte_length: u64,
    pub fork: u64,
    /// Blocks below `length` held locally.
    pub held: u64,
    pub peers: Vec<PeerInfo>,
}

/// A handle to one open log.
#[derive(Clone)]
pub struct Log {
    shared: Arc<Shared>,
}

impl Log {
    pub async fn open(options: LogOptions) -> LogResult<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let core = Core::open(&options.storage, options.identity, events.clone())?;
        let writer = core.identity().keypair().cloned().map(Writer::new);
        let shared = Shared {
            public_key: core.public_key(),
            discovery_key: core.discovery_key(),
            core: Mutex::new(core),
            writer,
            replicator: Replicator::new(options.replication),
            events,
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    // -----------------------------------------------------------------------
    // Identity and state
    // -----------------------------------------------------------------------

    pub fn public_key(&self) -> PublicKey {
        self.shared.public_key
    }

    /// Channel identifier used on the wire. Reveals nothing about the key.
    pub fn discovery_key(&self) -> Hash {
        self.shared.discovery_key
    }

    pub fn is_writable(&self) -> bool {
        self.shared.writer.is_some()
    }

    pub fn state(&self) -> LocalState {
        self.shared.core.lock().state()
    }

    pub fn length(&self) -> u64 {
        self.state().length
    }

    pub fn byte_length(&self) -> u64 {
        self.state().byte_length
    }

    pub fn fork(&self) -> u64 {
        self.state().fork
    }

    /// Whether block `index` is held locally.
    pub fn has(&self, index: u64) -> bool {
        self.shared.core.lock().has(index)
    }

    pub fn status(&self) -> LogStatus {
        let (local, held) = {
            let core = self.shared.core.lock();
            let local = core.state();
            (local, core.bitfield().count_ones(0, local.length))
        };
        LogStatus {
            public_key: self.public_key().to_hex(),
            discovery_key: hex::encode(self.discovery_key()),
            writable: self.is_writable(),
            length: local.length,
            byte_length: local.byte_length,
            fork: local.fork,
            held,
            peers: self.peers(),
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Block `index`, downloading and verifying it if it is not held.
    ///
    /// Waits for a capable peer for up to the configured request timeout,
    /// or indefinitely if there is none.
    pub async fn get(&self, index: u64) -> LogResult<Bytes> {
        let timeout = self.shared.replicator.config().request_timeout;
        self.shared.fetch_block(index, timeout).await
    }

    pub async fn get_timeout(&self, index: u64, timeout: Duration) -> LogResult<Bytes> {
        self.shared.fetch_block(index, Some(timeout)).await
    }

    /// Locate `byte_offset`: the block holding it and the offset inside
    /// that block. Fetches missing tree nodes from peers as needed.
    pub async fn seek(&self, byte_offset: u64) -> LogResult<(u64, u64)> {
        let timeout = self.shared.replicator.config().request_timeout;
        let mut resolver = SeekResolver::new(byte_offset);
        let mut asked_for_upgrade = false;
        loop {
            let outcome = {
                let core = self.shared.core.lock();
                resolver.step(core.tree())?
            };
            match outcome {
                SeekOutcome::Resolved { index, offset } => return Ok((index, offset)),
                SeekOutcome::NeedsNodes(nodes) => {
                    debug!(byte_offset, ?nodes, "seek needs nodes");
                    self.shared
                        .replicator
                        .request(&self.shared, RequestKey::Seek(byte_offset), timeout)
                        .await?;
                }
                SeekOutcome::NeedsPeerRoundtrip => {
                    if asked_for_upgrade || self.is_writable() {
                        return Err(LogError::SeekOutOfBounds {
                            offset: byte_offset,
                            byte_length: self.byte_length(),
                        });
                    }
                    asked_for_upgrade = true;
                    self.shared.request_upgrade(timeout).await?;
                }
            }
        }
    }

    /// Download `[start, end)` in the background.
    pub fn download(&self, start: u64, end: u64, linear: bool) -> RangeHandle {
        RangeHandle::spawn(self.shared.clone(), start, end.max(start), linear)
    }

    /// Ask peers for a newer signed tree.
    pub async fn update(&self) -> LogResult<UpgradeOutcome> {
        let timeout = self.shared.replicator.config().request_timeout;
        self.shared.request_upgrade(timeout).await
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Append blocks, returning the new length.
    pub async fn append<B: AsRef<[u8]>>(&self, blocks: &[B]) -> LogResult<u64> {
        let writer = self.shared.writer.as_ref().ok_or(LogError::NotWritable)?;
        let now = writer.append(&self.shared.core, blocks).await?;
        if !blocks.is_empty() {
            self.shared
                .replicator
                .on_local_append(now.length - blocks.len() as u64, now);
        }
        Ok(now.length)
    }

    /// Cut the log to `length` blocks and move to a new fork (the next one
    /// if `fork` is `None`).
    pub async fn truncate(&self, length: u64, fork: Option<u64>) -> LogResult<LocalState> {
        let writer = self.shared.writer.as_ref().ok_or(LogError::NotWritable)?;
        let now = writer.truncate(&self.shared.core, length, fork).await?;
        self.shared.replicator.on_local_truncate(now);
        Ok(now)
    }

    // -----------------------------------------------------------------------
    // Reorgs
    // -----------------------------------------------------------------------

    /// A verified reorg waiting to be applied, if any.
    pub fn pending_reorg(&self) -> Option<ReorgNotice> {
        self.shared.core.lock().pending_reorg()
    }

    /// Apply the pending reorg, discarding local blocks from its fork point.
    pub fn apply_reorg(&self) -> LogResult<Option<ReorgNotice>> {
        let applied = self.shared.core.lock().apply_reorg()?;
        if applied.is_some() {
            self.shared.replicator.on_reorg_applied(&self.shared);
        }
        Ok(applied)
    }

    // -----------------------------------------------------------------------
    // Proofs
    // -----------------------------------------------------------------------

    /// Inclusion proof for a held block against the current roots.
    pub fn proof(&self, index: u64) -> LogResult<BlockProof> {
        Ok(self.shared.core.lock().tree().proof(index)?)
    }

    /// Signed state plus the nodes proving it extends a tree of
    /// `from_length` blocks.
    pub fn upgrade_proof(&self, from_length: u64) -> LogResult<UpgradeProof> {
        Ok(self.shared.core.lock().tree().upgrade_proof(from_length)?)
    }

    // -----------------------------------------------------------------------
    // Replication
    // -----------------------------------------------------------------------

    /// Replicate over `stream`. Attach more logs with [`Mux::attach`].
    pub fn replicate<S>(&self, stream: S) -> Mux
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mux = Mux::new(stream);
        mux.attach(self);
        mux
    }

    /// Register a named extension and re-announce capabilities to peers.
    pub fn register_extension<H: ExtensionHandler>(&self, name: impl Into<String>, handler: H) -> Extension {
        let name = name.into();
        self.shared
            .replicator
            .register_extension(name.clone(), Arc::new(handler));
        info!(name = %name, "registered extension");
        Extension::new(name, self.shared.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.shared.events.subscribe()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.shared.replicator.peers()
    }

    /// Flush all regions to disk.
    pub fn flush(&self) -> LogResult<()> {
        self.shared.core.lock().flush()
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("public_key", &self.shared.public_key)
            .field("writable", &self.is_writable())
            .finish()
    }
}
