//! The error type surfaced by [`crate::log::Log`].

use crate::crypto::keys::{KeyError, PublicKey};
use crate::replication::framing::WireError;
use crate::storage::{InfoError, StorageError};
use crate::tree::TreeError;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("stored public key {stored} does not match supplied key {supplied}")]
    KeyConflict { stored: PublicKey, supplied: PublicKey },

    #[error("log is read-only")]
    NotWritable,

    #[error("block {index} is out of bounds for a log of length {length}")]
    OutOfBounds { index: u64, length: u64 },

    #[error("block of {size} bytes exceeds the limit of {max}")]
    BlockTooLarge { size: usize, max: usize },

    #[error("fork {requested} is not newer than the current fork {current}")]
    InvalidFork { current: u64, requested: u64 },

    #[error("data unavailable: {0}")]
    Unavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("peer protocol error: {0}")]
    PeerProtocol(String),

    #[error("proof for block {index} does not match the trusted root")]
    ProofMismatch { index: u64 },

    #[error("byte offset {offset} is beyond the log's {byte_length} bytes")]
    SeekOutOfBounds { offset: u64, byte_length: u64 },

    #[error("a reorg to fork {fork} at block {fork_point} is pending")]
    ReorgPending { fork: u64, fork_point: u64 },

    #[error(transparent)]
    Tree(TreeError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Info(InfoError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Key(#[from] KeyError),
}

impl From<TreeError> for LogError {
    fn from(e: TreeError) -> Self {
        match e {
            TreeError::ProofMismatch { index } => LogError::ProofMismatch { index },
            TreeError::OutOfBounds { index, length } => LogError::OutOfBounds { index, length },
            TreeError::Storage(e) => LogError::Storage(e),
            other => LogError::Tree(other),
        }
    }
}

impl From<InfoError> for LogError {
    fn from(e: InfoError) -> Self {
        match e {
            InfoError::KeyConflict { stored, supplied } => LogError::KeyConflict { stored, supplied },
            InfoError::Storage(e) => LogError::Storage(e),
            InfoError::Key(e) => LogError::Key(e),
            other => LogError::Info(other),
        }
    }
}

impl LogError {
    /// Whether a peer's response caused this, rather than local state.
    pub(crate) fn is_peer_fault(&self) -> bool {
        match self {
            LogError::ProofMismatch { .. } | LogError::OutOfBounds { .. } => true,
            LogError::Tree(e) => e.is_peer_fault(),
            _ => false,
        }
    }
}

pub type LogResult<T> = Result<T, LogError>;
