//! The writer half of a log: the signing key and the queue that keeps local
//! mutations in order.
//!
//! Appends and truncates from many tasks are serialized by one
//! `tokio::sync::Mutex`. A caller waiting its turn yields to the runtime
//! instead of blocking a worker thread, and the actual mutation happens in
//! one short [`Core`] critical section once the turn comes.

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::trace;

use super::core::{Core, LocalState};
use crate::crypto::keys::Keypair;
use crate::error::LogResult;

pub(crate) struct Writer {
    keypair: Keypair,
    turn: AsyncMutex<()>,
}

impl Writer {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            turn: AsyncMutex::new(()),
        }
    }

    pub async fn append<B: AsRef<[u8]>>(&self, core: &Mutex<Core>, blocks: &[B]) -> LogResult<LocalState> {
        let _turn = self.turn.lock().await;
        trace!(blocks = blocks.len(), "writer turn: append");
        core.lock().append(blocks, &self.keypair)
    }

    pub async fn truncate(&self, core: &Mutex<Core>, length: u64, fork: Option<u64>) -> LogResult<LocalState> {
        let _turn = self.turn.lock().await;
        trace!(length, "writer turn: truncate");
        core.lock().truncate(length, fork, &self.keypair)
    }
}
