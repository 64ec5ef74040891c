//! # Block Store
//!
//! Raw block bytes, keyed by the byte offset at which the block starts in
//! the log. The store knows nothing about indices or hashes: callers ask
//! the Merkle tree where block `i` starts and how long it is, then come
//! here with that location.
//!
//! No verification happens at this layer. The writer only stores what it
//! just hashed, and the replication path only stores what the tree has
//! already verified.
//!
//! Empty blocks occupy no bytes and therefore share their offset with the
//! next block; they are never written and always read back as empty.

use bytes::Bytes;
use sled::Tree;

use super::db::{key, remove_from, StorageError, StorageResult};

/// Where a block lives in the data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation {
    pub index: u64,
    pub offset: u64,
    pub size: u64,
}

/// Block bytes, stored in the `data` region.
#[derive(Debug, Clone)]
pub struct BlockStore {
    region: Tree,
}

impl BlockStore {
    pub fn open(region: Tree) -> Self {
        Self { region }
    }

    /// Store a block at its location. Overwrites whatever was there.
    pub fn put(&self, location: BlockLocation, bytes: &[u8]) -> StorageResult<()> {
        debug_assert_eq!(location.size, bytes.len() as u64);
        if location.size == 0 {
            return Ok(());
        }
        self.region.insert(key(location.offset), bytes)?;
        Ok(())
    }

    /// Store several consecutive blocks in one batch.
    pub fn put_batch<'a, I>(&self, blocks: I) -> StorageResult<()>
    where
        I: IntoIterator<Item = (BlockLocation, &'a [u8])>,
    {
        let mut batch = sled::Batch::default();
        for (location, bytes) in blocks {
            if location.size == 0 {
                continue;
            }
            batch.insert(&key(location.offset)[..], bytes);
        }
        self.region.apply_batch(batch)?;
        Ok(())
    }

    /// Read a block. [`StorageError::NotFound`] if the bytes are absent or
    /// do not have the expected length.
    pub fn get(&self, location: BlockLocation) -> StorageResult<Bytes> {
        if location.size == 0 {
            return Ok(Bytes::new());
        }
        match self.region.get(key(location.offset))? {
            Some(value) if value.len() as u64 == location.size => Ok(Bytes::from(value.to_vec())),
            Some(value) => Err(StorageError::Corrupt(format!(
                "block {} at offset {} has {} bytes, expected {}",
                location.index,
                location.offset,
                value.len(),
                location.size
            ))),
            None => Err(StorageError::NotFound(format!("block {}", location.index))),
        }
    }

    /// Whether anything is stored at this location.
    pub fn contains(&self, location: BlockLocation) -> StorageResult<bool> {
        if location.size == 0 {
            return Ok(true);
        }
        Ok(self.region.contains_key(key(location.offset))?)
    }

    /// Discard every block starting at or after `offset`.
    pub fn clear_from(&self, offset: u64) -> StorageResult<()> {
        remove_from(&self.region, offset)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db::LogDb;

    fn loc(index: u64, offset: u64, size: u64) -> BlockLocation {
        BlockLocation {
            index,
            offset,
            size,
        }
    }

    #[test]
    fn put_then_get() {
        let db = LogDb::open_temporary().unwrap();
        let store = BlockStore::open(db.data_region());
        store.put(loc(0, 0, 5), b"hello").unwrap();
        store.put(loc(1, 5, 5), b"world").unwrap();
        assert_eq!(store.get(loc(1, 5, 5)).unwrap().as_ref(), b"world");
    }

    #[test]
    fn missing_block_is_not_found() {
        let db = LogDb::open_temporary().unwrap();
        let store = BlockStore::open(db.data_region());
        let err = store.get(loc(3, 30, 1)).unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn wrong_length_is_corrupt() {
        let db = LogDb::open_temporary().unwrap();
        let store = BlockStore::open(db.data_region());
        store.put(loc(0, 0, 3), b"abc").unwrap();
        assert!(matches!(
            store.get(loc(0, 0, 4)).unwrap_err(),
            StorageError::Corrupt(_)
        ));
    }

    #[test]
    fn clear_from_drops_tail_blocks() {
        let db = LogDb::open_temporary().unwrap();
        let store = BlockStore::open(db.data_region());
        store
            .put_batch([
                (loc(0, 0, 1), &b"a"[..]),
                (loc(1, 1, 1), &b"b"[..]),
                (loc(2, 2, 1), &b"c"[..]),
            ])
            .unwrap();
        store.clear_from(1).unwrap();
        assert!(store.contains(loc(0, 0, 1)).unwrap());
        assert!(!store.contains(loc(1, 1, 1)).unwrap());
        assert!(!store.contains(loc(2, 2, 1)).unwrap());
    }

    #[test]
    fn empty_blocks_do_not_shadow_neighbours() {
        let db = LogDb::open_temporary().unwrap();
        let store = BlockStore::open(db.data_region());
        store.put(loc(0, 0, 0), b"").unwrap();
        store.put(loc(1, 0, 2), b"xy").unwrap();
        assert!(store.get(loc(0, 0, 0)).unwrap().is_empty());
        assert_eq!(store.get(loc(1, 0, 2)).unwrap().as_ref(), b"xy");
    }
}
