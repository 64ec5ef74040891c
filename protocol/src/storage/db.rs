//! # LogDb: Persistent Storage Engine
//!
//! The persistence layer for one log, built on sled's embedded key-value
//! store. All on-disk data flows through this module.
//!
//! ## Region Layout
//!
//! Each log owns four independent sled trees ("regions"):
//!
//! | Tree       | Key                      | Value                      |
//! |------------|--------------------------|----------------------------|
//! | `info`     | `identity` / `header`    | `bincode(record)`          |
//! | `tree`     | flat index (8B BE)       | `size (8B BE) ‖ hash (32B)`|
//! | `bitfield` | page number (8B BE)      | 4 KiB bit page             |
//! | `data`     | byte offset (8B BE)      | raw block bytes            |
//!
//! Integer keys are stored big-endian so that sled's lexicographic order
//! matches numeric order, which turns truncation into a single range scan.
//!
//! ## Locking
//!
//! sled already refuses to open one database twice. On top of that, a
//! writable log holds an `fs2` exclusive lock on `WRITER.lock` in the log
//! directory for as long as it is open, so two processes can never sign
//! competing histories from the same key.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use tracing::debug;

use crate::config::{DB_DIR, WRITER_LOCK_FILE};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("log at {path} is already open for writing by another process")]
    Locked { path: PathBuf },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Serialize a record for one of the regions.
pub(crate) fn encode<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Deserialize a record read from one of the regions.
pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    bincode::deserialize(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Big-endian key for an integer-indexed record.
pub(crate) fn key(n: u64) -> [u8; 8] {
    n.to_be_bytes()
}

/// Inverse of [`key`].
pub(crate) fn parse_key(bytes: &[u8]) -> StorageResult<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::Corrupt(format!("key of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}

// ---------------------------------------------------------------------------
// Storage location
// ---------------------------------------------------------------------------

/// Where a log keeps its regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Storage {
    /// In-memory sled database, discarded when the log is dropped.
    Temporary,
    /// On-disk log directory. Created on first open.
    Directory(PathBuf),
}

impl Storage {
    /// Shorthand for [`Storage::Directory`].
    pub fn dir<P: Into<PathBuf>>(path: P) -> Self {
        Storage::Directory(path.into())
    }
}

// ---------------------------------------------------------------------------
// Writer lock
// ---------------------------------------------------------------------------

/// Exclusive lock held by a writable log. Released on drop.
#[derive(Debug)]
pub struct WriterLock {
    file: File,
    path: PathBuf,
}

impl WriterLock {
    /// Acquire the writer lock for the log directory `dir`.
    ///
    /// Returns [`StorageError::Locked`] if another process holds it.
    pub fn acquire(dir: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(WRITER_LOCK_FILE);
        // The holder's PID stays in the file until we own the lock.
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked { path });
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        debug!(path = %path.display(), "acquired writer lock");
        Ok(Self { file, path })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

// ---------------------------------------------------------------------------
// LogDb
// ---------------------------------------------------------------------------

/// Persistent storage for one log: four regions plus an optional writer lock.
///
/// sled trees are cheap handles, so the regions are handed out by clone to
/// the components that own them (tree, bitfield, block store, info).
#[derive(Debug)]
pub struct LogDb {
    db: Db,
    info: Tree,
    nodes: Tree,
    bitfield: Tree,
    data: Tree,
    dir: Option<PathBuf>,
    lock: Option<WriterLock>,
}

impl LogDb {
    /// Open (or create) the regions for `storage`.
    pub fn open(storage: &Storage) -> StorageResult<Self> {
        match storage {
            Storage::Temporary => Self::open_temporary(),
            Storage::Directory(dir) => {
                let path = dir.join(DB_DIR);
                std::fs::create_dir_all(&path)?;
                let db = sled::open(&path)?;
                Self::from_db(db, Some(dir.clone()))
            }
        }
    }

    /// Create a temporary database that lives in memory and is cleaned up
    /// when the `LogDb` is dropped.
    pub fn open_temporary() -> StorageResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, None)
    }

    fn from_db(db: Db, dir: Option<PathBuf>) -> StorageResult<Self> {
        Ok(Self {
            info: db.open_tree("info")?,
            nodes: db.open_tree("tree")?,
            bitfield: db.open_tree("bitfield")?,
            data: db.open_tree("data")?,
            db,
            dir,
            lock: None,
        })
    }

    /// Take the writer lock. A no-op for temporary storage, which no other
    /// process can reach anyway.
    pub fn lock_for_writing(&mut self) -> StorageResult<()> {
        if self.lock.is_some() {
            return Ok(());
        }
        if let Some(dir) = &self.dir {
            self.lock = Some(WriterLock::acquire(dir)?);
        }
        Ok(())
    }

    /// Whether this handle holds the writer lock.
    pub fn is_locked_for_writing(&self) -> bool {
        self.lock.is_some()
    }

    /// The identity record region.
    pub fn info_region(&self) -> Tree {
        self.info.clone()
    }

    /// The tree-node region.
    pub fn node_region(&self) -> Tree {
        self.nodes.clone()
    }

    /// The bitfield region.
    pub fn bitfield_region(&self) -> Tree {
        self.bitfield.clone()
    }

    /// The block data region.
    pub fn data_region(&self) -> Tree {
        self.data.clone()
    }

    /// Force a flush of all pending writes to disk.
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Remove every integer-keyed record at or above `from` in `region`.
pub(crate) fn remove_from(region: &Tree, from: u64) -> StorageResult<usize> {
    let mut batch = sled::Batch::default();
    let mut removed = 0;
    for entry in region.range(key(from)..) {
        let (k, _) = entry?;
        batch.remove(k);
        removed += 1;
    }
    region.apply_batch(batch)?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_temporary_database() {
        let db = LogDb::open_temporary().expect("should create temp db");
        assert!(db.node_region().is_empty());
        assert!(db.data_region().is_empty());
    }

    #[test]
    fn regions_are_independent() {
        let db = LogDb::open_temporary().unwrap();
        db.node_region().insert(key(1), b"node".to_vec()).unwrap();
        assert!(db.data_region().get(key(1)).unwrap().is_none());
        assert!(db.bitfield_region().get(key(1)).unwrap().is_none());
    }

    #[test]
    fn reopen_persistent_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::dir(dir.path());
        {
            let db = LogDb::open(&storage).unwrap();
            db.data_region().insert(key(0), b"hello".to_vec()).unwrap();
            db.flush().unwrap();
        }
        let db = LogDb::open(&storage).unwrap();
        let value = db.data_region().get(key(0)).unwrap().unwrap();
        assert_eq!(value.as_ref(), b"hello");
    }

    #[test]
    fn writer_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let first = WriterLock::acquire(dir.path()).unwrap();
        let err = WriterLock::acquire(dir.path()).unwrap_err();
        assert!(matches!(err, StorageError::Locked { .. }));
        drop(first);
        assert!(WriterLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn failed_acquire_keeps_the_holders_pid() {
        let dir = tempfile::tempdir().unwrap();
        let held = WriterLock::acquire(dir.path()).unwrap();
        let pid = format!("{}\n", std::process::id());
        assert_eq!(std::fs::read_to_string(held.path()).unwrap(), pid);

        assert!(WriterLock::acquire(dir.path()).is_err());
        assert_eq!(std::fs::read_to_string(held.path()).unwrap(), pid);

        // A stale, longer file is rewritten once the lock is taken.
        drop(held);
        std::fs::write(dir.path().join(WRITER_LOCK_FILE), "999999999999\n").unwrap();
        let again = WriterLock::acquire(dir.path()).unwrap();
        assert_eq!(std::fs::read_to_string(again.path()).unwrap(), pid);
    }

    #[test]
    fn remove_from_truncates_tail() {
        let db = LogDb::open_temporary().unwrap();
        let region = db.data_region();
        for i in 0..10u64 {
            region.insert(key(i), vec![i as u8]).unwrap();
        }
        let removed = remove_from(&region, 4).unwrap();
        assert_eq!(removed, 6);
        assert_eq!(region.len(), 4);
        assert!(region.get(key(3)).unwrap().is_some());
        assert!(region.get(key(4)).unwrap().is_none());
    }

    #[test]
    fn parse_key_rejects_wrong_length() {
        assert_eq!(parse_key(&key(42)).unwrap(), 42);
        assert!(parse_key(b"abc").is_err());
    }

    #[test]
    fn temporary_storage_skips_lock() {
        let mut db = LogDb::open_temporary().unwrap();
        db.lock_for_writing().unwrap();
        assert!(!db.is_locked_for_writing());
    }
}
