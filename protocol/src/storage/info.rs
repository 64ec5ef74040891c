//! # Info: Identity Header
//!
//! The identity record of a log: its public key, the secret key if this
//! copy is the writer, and the fork counter. Next to it sits the tree
//! header: the last signed `(length, fork, signature)` this copy accepted,
//! so a restarted reader still holds an authenticated root without asking
//! anyone.
//!
//! Writability is resolved once, at open, into an [`Identity`] and never
//! changes afterwards.

use serde::{Deserialize, Serialize};
use sled::Tree;
use tracing::info;

use super::db::{decode, encode, StorageError};
use crate::crypto::keys::{KeyError, Keypair, PublicKey, Signature};
use crate::crypto::{discovery_key, Hash};

const IDENTITY_KEY: &[u8] = b"identity";
const HEADER_KEY: &[u8] = b"header";
const RECORD_VERSION: u16 = 1;

/// Errors raised while opening or updating the identity record.
#[derive(Debug, thiserror::Error)]
pub enum InfoError {
    #[error("stored public key {stored} does not match supplied key {supplied}")]
    KeyConflict { stored: PublicKey, supplied: PublicKey },

    #[error("unsupported identity record version {0}")]
    UnsupportedVersion(u16),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<sled::Error> for InfoError {
    fn from(e: sled::Error) -> Self {
        InfoError::Storage(e.into())
    }
}

/// Who this copy of the log is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// A reader. Can verify and serve, never append or truncate.
    ReadOnly(PublicKey),
    /// The writer. Holds the only signing key for the log.
    Writable(Keypair),
}

impl Identity {
    /// The log's public key.
    pub fn public_key(&self) -> PublicKey {
        match self {
            Identity::ReadOnly(pk) => *pk,
            Identity::Writable(kp) => kp.public_key(),
        }
    }

    /// The signing key, if this copy is writable.
    pub fn keypair(&self) -> Option<&Keypair> {
        match self {
            Identity::ReadOnly(_) => None,
            Identity::Writable(kp) => Some(kp),
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Identity::Writable(_))
    }
}

/// The last tree state this copy accepted as authentic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeHeader {
    pub fork: u64,
    pub length: u64,
    pub byte_length: u64,
    /// Writer's signature over this state. `None` only for the empty tree.
    pub signature: Option<Signature>,
}

impl TreeHeader {
    pub fn empty(fork: u64) -> Self {
        Self {
            fork,
            length: 0,
            byte_length: 0,
            signature: None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct IdentityRecord {
    version: u16,
    public_key: PublicKey,
    secret_key: Option<Vec<u8>>,
    fork: u64,
}

/// The persisted identity record of one log.
#[derive(Debug)]
pub struct Info {
    region: Tree,
    identity: Identity,
    fork: u64,
    discovery_key: Hash,
}

impl Info {
    /// Open the identity record, creating it on first use.
    ///
    /// - No stored record, no supplied identity: a fresh keypair is
    ///   generated and this copy becomes the writer of a new log.
    /// - No stored record, supplied identity: it is stored as given.
    /// - Stored record, supplied identity: the public keys must match, else
    ///   [`InfoError::KeyConflict`]. A supplied secret key upgrades a stored
    ///   read-only record to writable.
    pub fn open(region: Tree, supplied: Option<Identity>) -> Result<Self, InfoError> {
        let stored = match region.get(IDENTITY_KEY)? {
            Some(bytes) => Some(decode::<IdentityRecord>(&bytes)?),
            None => None,
        };

        let (identity, fork, dirty) = match (stored, supplied) {
            (None, None) => {
                let kp = Keypair::generate();
                info!(public_key = %kp.public_key(), "generated new log identity");
                (Identity::Writable(kp), 0, true)
            }
            (None, Some(identity)) => (identity, 0, true),
            (Some(record), supplied) => {
                if record.version != RECORD_VERSION {
                    return Err(InfoError::UnsupportedVersion(record.version));
                }
                let stored_identity = match &record.secret_key {
                    Some(secret) => {
                        let secret: [u8; 32] = secret
                            .as_slice()
                            .try_into()
                            .map_err(|_| KeyError::InvalidSecretKey)?;
                        Identity::Writable(Keypair::from_parts(&secret, &record.public_key)?)
                    }
                    None => Identity::ReadOnly(record.public_key),
                };
                match supplied {
                    None => (stored_identity, record.fork, false),
                    Some(supplied) => {
                        if supplied.public_key() != record.public_key {
                            return Err(InfoError::KeyConflict {
                                stored: record.public_key,
                                supplied: supplied.public_key(),
                            });
                        }
                        let upgraded = !stored_identity.is_writable() && supplied.is_writable();
                        let identity = if upgraded { supplied } else { stored_identity };
                        (identity, record.fork, upgraded)
                    }
                }
            }
        };

        let info = Self {
            discovery_key: discovery_key(identity.public_key().as_bytes()),
            region,
            identity,
            fork,
        };
        if dirty {
            info.persist()?;
        }
        Ok(info)
    }

    fn persist(&self) -> Result<(), InfoError> {
        let record = IdentityRecord {
            version: RECORD_VERSION,
            public_key: self.identity.public_key(),
            secret_key: self
                .identity
                .keypair()
                .map(|kp| kp.secret_key_bytes().to_vec()),
            fork: self.fork,
        };
        self.region.insert(IDENTITY_KEY, encode(&record)?)?;
        Ok(())
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn discovery_key(&self) -> Hash {
        self.discovery_key
    }

    pub fn fork(&self) -> u64 {
        self.fork
    }

    /// Record a new fork counter.
    pub fn set_fork(&mut self, fork: u64) -> Result<(), InfoError> {
        self.fork = fork;
        self.persist()
    }

    /// The last accepted tree header, if any.
    pub fn header(&self) -> Result<Option<TreeHeader>, InfoError> {
        match self.region.get(HEADER_KEY)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Persist a newly accepted tree header.
    pub fn save_header(&self, header: &TreeHeader) -> Result<(), InfoError> {
        self.region.insert(HEADER_KEY, encode(header)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db::LogDb;

    #[test]
    fn fresh_open_generates_writer() {
        let db = LogDb::open_temporary().unwrap();
        let info = Info::open(db.info_region(), None).unwrap();
        assert!(info.identity().is_writable());
        assert_eq!(info.fork(), 0);
    }

    #[test]
    fn reopen_keeps_identity_and_fork() {
        let db = LogDb::open_temporary().unwrap();
        let pk = {
            let mut info = Info::open(db.info_region(), None).unwrap();
            info.set_fork(3).unwrap();
            info.public_key()
        };
        let info = Info::open(db.info_region(), None).unwrap();
        assert_eq!(info.public_key(), pk);
        assert_eq!(info.fork(), 3);
        assert!(info.identity().is_writable());
    }

    #[test]
    fn mismatched_key_is_a_conflict() {
        let db = LogDb::open_temporary().unwrap();
        Info::open(db.info_region(), None).unwrap();
        let other = Keypair::generate().public_key();
        let err = Info::open(db.info_region(), Some(Identity::ReadOnly(other))).unwrap_err();
        assert!(matches!(err, InfoError::KeyConflict { .. }));
    }

    #[test]
    fn reader_stays_read_only() {
        let db = LogDb::open_temporary().unwrap();
        let pk = Keypair::generate().public_key();
        let info = Info::open(db.info_region(), Some(Identity::ReadOnly(pk))).unwrap();
        assert!(!info.identity().is_writable());
        let reopened = Info::open(db.info_region(), None).unwrap();
        assert_eq!(reopened.identity(), &Identity::ReadOnly(pk));
    }

    #[test]
    fn supplied_secret_upgrades_reader() {
        let db = LogDb::open_temporary().unwrap();
        let kp = Keypair::generate();
        Info::open(db.info_region(), Some(Identity::ReadOnly(kp.public_key()))).unwrap();
        let info = Info::open(db.info_region(), Some(Identity::Writable(kp.clone()))).unwrap();
        assert!(info.identity().is_writable());
        let reopened = Info::open(db.info_region(), None).unwrap();
        assert!(reopened.identity().is_writable());
    }

    #[test]
    fn discovery_key_is_derived_not_copied() {
        let db = LogDb::open_temporary().unwrap();
        let info = Info::open(db.info_region(), None).unwrap();
        assert_ne!(&info.discovery_key(), info.public_key().as_bytes());
    }

    #[test]
    fn header_round_trips() {
        let db = LogDb::open_temporary().unwrap();
        let info = Info::open(db.info_region(), None).unwrap();
        assert!(info.header().unwrap().is_none());
        let header = TreeHeader {
            fork: 1,
            length: 5,
            byte_length: 42,
            signature: None,
        };
        info.save_header(&header).unwrap();
        assert_eq!(info.header().unwrap(), Some(header));
    }
}
