//! # Log Core
//!
//! The tree, bitfield, block store and identity record of one log, mutated
//! together. A [`Core`] always sits behind one `parking_lot::Mutex`, and
//! every method here is synchronous: a caller locks, mutates, unlocks, and
//! only then awaits anything. No task can observe a block that is stored but
//! not yet in the bitfield, or a tree that moved without its header.
//!
//! Write order for local appends is block store, bitfield, tree, signature,
//! header. A crash between steps leaves at worst unreferenced bytes, never a
//! bitfield bit or header that points at missing data.

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::MAX_BLOCK_SIZE;
use crate::crypto::keys::{Keypair, PublicKey};
use crate::crypto::Hash;
use crate::error::{LogError, LogResult};
use crate::events::LogEvent;
use crate::storage::{Bitfield, BlockLocation, BlockStore, Identity, Info, LogDb, Storage};
use crate::tree::{BlockProof, MerkleTree, UpgradeKind, UpgradeProof, VerifiedUpgrade};

/// Length, byte length and fork of the local tree at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalState {
    pub length: u64,
    pub byte_length: u64,
    pub fork: u64,
}

/// A verified tree on a newer fork that would discard local blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorgNotice {
    pub fork: u64,
    pub length: u64,
    pub fork_point: u64,
}

/// What accepting a peer's signed tree state did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// Nothing newer was offered.
    Unchanged,
    /// The local tree now has `length` blocks on `fork`.
    Upgraded { length: u64, fork: u64 },
    /// A reorg is waiting for [`crate::log::Log::apply_reorg`].
    Reorg(ReorgNotice),
}

/// What became of a block received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Verified and stored.
    Stored,
    /// Already held locally; the copy was not needed.
    Duplicate,
    /// The local tree moved on since the request went out.
    Stale,
}

/// Everything a server needs to answer one block request.
pub type Served = (Bytes, BlockProof, Option<UpgradeProof>);

pub(crate) struct Core {
    db: LogDb,
    info: Info,
    tree: MerkleTree,
    bitfield: Bitfield,
    store: BlockStore,
    pending_reorg: Option<VerifiedUpgrade>,
    events: broadcast::Sender<LogEvent>,
}

impl Core {
    pub fn open(
        storage: &Storage,
        identity: Option<Identity>,
        events: broadcast::Sender<LogEvent>,
    ) -> LogResult<Self> {
        let mut db = LogDb::open(storage)?;
        let info = Info::open(db.info_region(), identity)?;
        if info.identity().is_writable() {
            db.lock_for_writing()?;
        }
        let tree = MerkleTree::open(db.node_region(), info.header()?, info.fork())?;
        let bitfield = Bitfield::open(db.bitfield_region())?;
        let store = BlockStore::open(db.data_region());
        info!(
            public_key = %info.public_key(),
            length = tree.length(),
            fork = tree.fork(),
            writable = info.identity().is_writable(),
            "opened log"
        );
        Ok(Self {
            db,
            info,
            tree,
            bitfield,
            store,
            pending_reorg: None,
            events,
        })
    }

    fn emit(&self, event: LogEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Local reads
    // -----------------------------------------------------------------------

    pub fn identity(&self) -> &Identity {
        self.info.identity()
    }

    pub fn public_key(&self) -> PublicKey {
        self.info.public_key()
    }

    pub fn discovery_key(&self) -> Hash {
        self.info.discovery_key()
    }

    pub fn state(&self) -> LocalState {
        LocalState {
            length: self.tree.length(),
            byte_length: self.tree.byte_length(),
            fork: self.tree.fork(),
        }
    }

    pub fn tree(&self) -> &MerkleTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut MerkleTree {
        &mut self.tree
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn pending_reorg(&self) -> Option<ReorgNotice> {
        let upgrade = self.pending_reorg.as_ref()?;
        match upgrade.kind {
            UpgradeKind::Reorg { fork_point } => Some(ReorgNotice {
                fork: upgrade.fork(),
                length: upgrade.length(),
                fork_point,
            }),
            _ => None,
        }
    }

    pub fn has(&self, index: u64) -> bool {
        index < self.tree.length() && self.bitfield.get(index)
    }

    /// The block's bytes if they are held locally.
    pub fn read_local(&self, index: u64) -> LogResult<Option<Bytes>> {
        if !self.has(index) {
            return Ok(None);
        }
        let location = self.tree.block_location(index)?;
        Ok(Some(self.store.get(location)?))
    }

    // -----------------------------------------------------------------------
    // Local writes
    // -----------------------------------------------------------------------

    pub fn append<B: AsRef<[u8]>>(&mut self, blocks: &[B], keypair: &Keypair) -> LogResult<LocalState> {
        if let Some(big) = blocks.iter().find(|b| b.as_ref().len() > MAX_BLOCK_SIZE) {
            return Err(LogError::BlockTooLarge {
                size: big.as_ref().len(),
                max: MAX_BLOCK_SIZE,
            });
        }
        if blocks.is_empty() {
            return Ok(self.state());
        }

        let start = self.tree.length();
        let mut offset = self.tree.byte_length();
        let mut locations = Vec::with_capacity(blocks.len());
        for (i, block) in blocks.iter().enumerate() {
            let size = block.as_ref().len() as u64;
            locations.push(BlockLocation {
                index: start + i as u64,
                offset,
                size,
            });
            offset += size;
        }

        self.store
            .put_batch(locations.iter().copied().zip(blocks.iter().map(|b| b.as_ref())))?;
        self.bitfield.set_range(start, blocks.len() as u64, true);
        self.tree.append(blocks)?;
        self.tree.set_signature(keypair.sign(&self.tree.signable()));
        self.bitfield.flush()?;
        self.info.save_header(&self.tree.header())?;

        let state = self.state();
        debug!(length = state.length, appended = blocks.len(), "appended blocks");
        self.emit(LogEvent::Append {
            length: state.length,
            byte_length: state.byte_length,
        });
        Ok(state)
    }

    pub fn truncate(&mut self, length: u64, fork: Option<u64>, keypair: &Keypair) -> LogResult<LocalState> {
        let current = self.tree.fork();
        let fork = fork.unwrap_or(current + 1);
        if fork <= current {
            return Err(LogError::InvalidFork {
                current,
                requested: fork,
            });
        }
        if length > self.tree.length() {
            return Err(LogError::OutOfBounds {
                index: length,
                length: self.tree.length(),
            });
        }

        let offset = self.tree.prefix_byte_length(length)?;
        self.bitfield.clear_from(length);
        self.store.clear_from(offset)?;
        self.tree.truncate(length, fork)?;
        self.tree.set_signature(keypair.sign(&self.tree.signable()));
        self.info.set_fork(fork)?;
        self.bitfield.flush()?;
        self.info.save_header(&self.tree.header())?;
        self.pending_reorg = None;

        info!(length, fork, "truncated log");
        self.emit(LogEvent::Truncate { length, fork });
        Ok(self.state())
    }

    // -----------------------------------------------------------------------
    // Serving peers
    // -----------------------------------------------------------------------

    /// Block, proof and (if we are longer) upgrade for a requester that
    /// holds `length` blocks on `fork`. `None` if we cannot answer.
    pub fn serve_block(&self, index: u64, fork: u64, length: u64) -> LogResult<Option<Served>> {
        if fork != self.tree.fork() || self.tree.length() < length || !self.has(index) {
            return Ok(None);
        }
        let Some(bytes) = self.read_local(index)? else {
            return Ok(None);
        };
        let proof = self.tree.proof(index)?;
        let upgrade = if self.tree.length() > length {
            Some(self.tree.upgrade_proof(length)?)
        } else {
            None
        };
        Ok(Some((bytes, proof, upgrade)))
    }

    /// Signed state for a requester on `fork` with `length` blocks.
    pub fn serve_upgrade(&self, fork: u64, length: u64) -> LogResult<Option<UpgradeProof>> {
        if self.tree.signature().is_none() {
            return Ok(None);
        }
        let from = if fork == self.tree.fork() { length } else { 0 };
        Ok(Some(self.tree.upgrade_proof(from)?))
    }

    // -----------------------------------------------------------------------
    // Accepting peer data
    // -----------------------------------------------------------------------

    /// Verify and adopt a signed tree state.
    ///
    /// Reorgs that would discard local blocks are parked, never applied here.
    pub fn receive_upgrade(&mut self, proof: UpgradeProof) -> LogResult<UpgradeOutcome> {
        let public_key = self.info.public_key();
        let verified = self.tree.verify_upgrade(proof, &public_key)?;
        match verified.kind {
            UpgradeKind::Unchanged => Ok(UpgradeOutcome::Unchanged),
            UpgradeKind::Reorg { fork_point } if fork_point < self.tree.length() => {
                let notice = ReorgNotice {
                    fork: verified.fork(),
                    length: verified.length(),
                    fork_point,
                };
                let known = self.pending_reorg().map_or(false, |p| p.fork >= notice.fork);
                if !known {
                    warn!(fork = notice.fork, fork_point, "peer offers a reorg");
                    self.pending_reorg = Some(verified);
                    self.emit(LogEvent::Reorg {
                        fork: notice.fork,
                        fork_point,
                    });
                }
                Ok(UpgradeOutcome::Reorg(notice))
            }
            _ => {
                let fork = verified.fork();
                let forked = fork != self.tree.fork();
                self.tree.apply_upgrade(verified)?;
                if forked {
                    self.info.set_fork(fork)?;
                }
                self.info.save_header(&self.tree.header())?;
                let length = self.tree.length();
                debug!(length, fork, "upgraded tree");
                self.emit(LogEvent::Upgrade { length, fork });
                Ok(UpgradeOutcome::Upgraded { length, fork })
            }
        }
    }

    /// Apply the parked reorg, discarding blocks from its fork point on.
    pub fn apply_reorg(&mut self) -> LogResult<Option<ReorgNotice>> {
        let Some(notice) = self.pending_reorg() else {
            return Ok(None);
        };
        let Some(upgrade) = self.pending_reorg.take() else {
            return Ok(None);
        };
        let keep = notice.fork_point.min(self.tree.length());
        let offset = self.tree.prefix_byte_length(keep)?;
        self.bitfield.clear_from(keep);
        self.store.clear_from(offset)?;
        self.tree.apply_upgrade(upgrade)?;
        self.info.set_fork(notice.fork)?;
        self.bitfield.flush()?;
        self.info.save_header(&self.tree.header())?;

        info!(fork = notice.fork, fork_point = keep, "applied reorg");
        self.emit(LogEvent::Truncate {
            length: keep,
            fork: notice.fork,
        });
        self.emit(LogEvent::Upgrade {
            length: notice.length,
            fork: notice.fork,
        });
        Ok(Some(notice))
    }

    /// Verify a downloaded block and store it.
    ///
    /// `fork` and `length` describe the tree the request was issued from.
    /// A proof shaped for a tree we have since moved past is dropped without
    /// being checked.
    pub fn receive_block(
        &mut self,
        index: u64,
        bytes: &[u8],
        proof: &BlockProof,
        upgrade: Option<UpgradeProof>,
        fork: u64,
        length: u64,
    ) -> LogResult<Received> {
        let local = self.tree.length();
        let shaped_for_us = match &upgrade {
            None => length == local,
            Some(u) => u.length == local || (u.length > local && u.from_length == local),
        };
        if self.tree.fork() != fork || !shaped_for_us {
            return Ok(Received::Stale);
        }
        if let Some(upgrade) = upgrade {
            if let UpgradeOutcome::Reorg(_) = self.receive_upgrade(upgrade)? {
                return Ok(Received::Stale);
            }
        }
        if self.has(index) {
            return Ok(Received::Duplicate);
        }
        self.tree.verify_and_add(index, bytes, proof)?;
        let location = self.tree.block_location(index)?;
        self.store.put(location, bytes)?;
        self.bitfield.set(index, true);
        self.bitfield.flush()?;
        Ok(Received::Stored)
    }

    pub fn flush(&self) -> LogResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
