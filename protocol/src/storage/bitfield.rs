//! # Bitfield
//!
//! One bit per block: set iff the block's bytes are present locally and
//! were verified against a signed root when they were written.
//!
//! The bitset is split into 4 KiB pages. Pages that were never touched are
//! not materialised, so a sparse reader holding blocks 0 and 10_000_000
//! pays for two pages, not for ten million bits. Dirty pages are written to
//! the `bitfield` region on [`Bitfield::flush`]; an all-zero page is removed
//! instead of written.
//!
//! The same type, opened with [`Bitfield::in_memory`], tracks what each
//! remote peer *claims* to have. Those claims are never persisted.

use std::collections::{BTreeMap, BTreeSet};

use sled::Tree;

use super::db::{key, parse_key, StorageResult};
use crate::config::{BITFIELD_PAGE_BITS, BITFIELD_PAGE_BYTES};

/// A paged, optionally persisted bitset.
#[derive(Debug, Default)]
pub struct Bitfield {
    pages: BTreeMap<u64, Box<[u8]>>,
    dirty: BTreeSet<u64>,
    region: Option<Tree>,
}

fn locate(index: u64) -> (u64, usize, u8) {
    let page = index / BITFIELD_PAGE_BITS;
    let bit = index % BITFIELD_PAGE_BITS;
    (page, (bit / 8) as usize, 1u8 << (bit % 8))
}

impl Bitfield {
    /// A bitfield that lives only in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load every persisted page from `region`.
    pub fn open(region: Tree) -> StorageResult<Self> {
        let mut pages = BTreeMap::new();
        for entry in region.iter() {
            let (k, v) = entry?;
            let page = parse_key(&k)?;
            let mut buf = vec![0u8; BITFIELD_PAGE_BYTES].into_boxed_slice();
            let n = v.len().min(BITFIELD_PAGE_BYTES);
            buf[..n].copy_from_slice(&v[..n]);
            pages.insert(page, buf);
        }
        Ok(Self {
            pages,
            dirty: BTreeSet::new(),
            region: Some(region),
        })
    }

    pub fn get(&self, index: u64) -> bool {
        let (page, byte, mask) = locate(index);
        self.pages
            .get(&page)
            .map(|p| p[byte] & mask != 0)
            .unwrap_or(false)
    }

    /// Set or clear one bit. Returns `true` if the bit changed.
    pub fn set(&mut self, index: u64, value: bool) -> bool {
        let (page, byte, mask) = locate(index);
        if !value && !self.pages.contains_key(&page) {
            return false;
        }
        let buf = self
            .pages
            .entry(page)
            .or_insert_with(|| vec![0u8; BITFIELD_PAGE_BYTES].into_boxed_slice());
        let before = buf[byte] & mask != 0;
        if before == value {
            return false;
        }
        if value {
            buf[byte] |= mask;
        } else {
            buf[byte] &= !mask;
        }
        self.dirty.insert(page);
        true
    }

    /// Set or clear `[start, start + length)`, a page and then a byte at a
    /// time. Clearing never materialises a page.
    pub fn set_range(&mut self, start: u64, length: u64, value: bool) {
        let end = start.saturating_add(length);
        let fill = if value { 0xff } else { 0 };
        let mut i = start;
        while i < end {
            let page = i / BITFIELD_PAGE_BITS;
            let page_end = (page + 1).saturating_mul(BITFIELD_PAGE_BITS).min(end);
            if !value && !self.pages.contains_key(&page) {
                i = page_end;
                continue;
            }
            let buf = self
                .pages
                .entry(page)
                .or_insert_with(|| vec![0u8; BITFIELD_PAGE_BYTES].into_boxed_slice());
            while i < page_end {
                let bit = i % BITFIELD_PAGE_BITS;
                let byte = (bit / 8) as usize;
                if bit % 8 == 0 && page_end - i >= 8 {
                    let whole = ((page_end - i) / 8) as usize;
                    buf[byte..byte + whole].fill(fill);
                    i += whole as u64 * 8;
                } else {
                    let mask = 1u8 << (bit % 8);
                    if value {
                        buf[byte] |= mask;
                    } else {
                        buf[byte] &= !mask;
                    }
                    i += 1;
                }
            }
            self.dirty.insert(page);
        }
    }

    /// Clear every bit at or above `index`.
    pub fn clear_from(&mut self, index: u64) {
        let (first_page, _, _) = locate(index);
        let doomed: Vec<u64> = self
            .pages
            .range(first_page + 1..)
            .map(|(page, _)| *page)
            .collect();
        for page in doomed {
            self.pages.remove(&page);
            self.dirty.insert(page);
        }
        let page_end = (first_page + 1).saturating_mul(BITFIELD_PAGE_BITS);
        self.set_range(index, page_end - index, false);
    }

    /// First index in `[start, end)` whose bit is clear.
    pub fn first_unset(&self, start: u64, end: u64) -> Option<u64> {
        let mut i = start;
        while i < end {
            let (page, byte, _) = locate(i);
            match self.pages.get(&page) {
                None => return Some(i),
                Some(buf) if i % 8 == 0 && buf[byte] == 0xff => i += 8,
                Some(_) => {
                    if !self.get(i) {
                        return Some(i);
                    }
                    i += 1;
                }
            }
        }
        None
    }

    /// First index in `[start, end)` whose bit is set.
    pub fn first_set(&self, start: u64, end: u64) -> Option<u64> {
        let mut i = start;
        while i < end {
            let (page, byte, _) = locate(i);
            match self.pages.get(&page) {
                None => i = (page + 1) * BITFIELD_PAGE_BITS,
                Some(buf) if i % 8 == 0 && buf[byte] == 0 => i += 8,
                Some(_) => {
                    if self.get(i) {
                        return Some(i);
                    }
                    i += 1;
                }
            }
        }
        None
    }

    /// Number of set bits in `[start, end)`.
    pub fn count_ones(&self, start: u64, end: u64) -> u64 {
        let mut count = 0;
        let mut i = start;
        while let Some(next) = self.first_set(i, end) {
            count += 1;
            i = next + 1;
        }
        count
    }

    /// Maximal runs of set bits in `[start, end)` as `(start, length)`.
    pub fn runs(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        let mut runs = Vec::new();
        let mut i = start;
        while let Some(run_start) = self.first_set(i, end) {
            let run_end = self.first_unset(run_start, end).unwrap_or(end);
            runs.push((run_start, run_end - run_start));
            i = run_end;
        }
        runs
    }

    /// Write dirty pages to the backing region. A no-op in memory.
    pub fn flush(&mut self) -> StorageResult<()> {
        let Some(region) = &self.region else {
            self.dirty.clear();
            return Ok(());
        };
        let mut batch = sled::Batch::default();
        for page in std::mem::take(&mut self.dirty) {
            match self.pages.get(&page) {
                Some(buf) if buf.iter().any(|b| *b != 0) => {
                    batch.insert(&key(page)[..], &buf[..]);
                }
                _ => batch.remove(&key(page)[..]),
            }
        }
        region.apply_batch(batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db::LogDb;

    #[test]
    fn set_and_get() {
        let mut bf = Bitfield::in_memory();
        assert!(!bf.get(5));
        assert!(bf.set(5, true));
        assert!(!bf.set(5, true));
        assert!(bf.get(5));
        assert!(bf.set(5, false));
        assert!(!bf.get(5));
    }

    #[test]
    fn sparse_pages() {
        let mut bf = Bitfield::in_memory();
        bf.set(0, true);
        bf.set(10_000_000, true);
        assert_eq!(bf.pages.len(), 2);
        assert!(bf.get(10_000_000));
        assert!(!bf.get(9_999_999));
    }

    #[test]
    fn first_unset_and_set() {
        let mut bf = Bitfield::in_memory();
        bf.set_range(0, 20, true);
        assert_eq!(bf.first_unset(0, 100), Some(20));
        assert_eq!(bf.first_unset(0, 20), None);
        assert_eq!(bf.first_set(20, 100), None);
        bf.set(70_000, true);
        assert_eq!(bf.first_set(20, 100_000), Some(70_000));
    }

    #[test]
    fn ranges_span_pages_and_partial_bytes() {
        let mut bf = Bitfield::in_memory();
        let length = BITFIELD_PAGE_BITS * 3 + 11;
        bf.set_range(5, length, true);
        assert_eq!(bf.pages.len(), 4);
        assert!(!bf.get(4));
        assert!(bf.get(5));
        assert!(bf.get(BITFIELD_PAGE_BITS));
        assert!(bf.get(5 + length - 1));
        assert!(!bf.get(5 + length));
        assert_eq!(bf.count_ones(0, length + 100), length);

        bf.set_range(100, 50, false);
        assert!(bf.get(99));
        assert!(!bf.get(100));
        assert!(!bf.get(149));
        assert!(bf.get(150));
        assert_eq!(bf.count_ones(0, length + 100), length - 50);

        // Clearing untouched pages allocates nothing.
        bf.set_range(BITFIELD_PAGE_BITS * 10, BITFIELD_PAGE_BITS * 5, false);
        assert_eq!(bf.pages.len(), 4);
        assert_eq!(bf.runs(0, length + 100), vec![(5, 95), (150, length - 145)]);
    }

    #[test]
    fn clear_from_discards_tail() {
        let mut bf = Bitfield::in_memory();
        bf.set_range(0, 10, true);
        bf.set(BITFIELD_PAGE_BITS * 3, true);
        bf.clear_from(4);
        assert!(bf.get(3));
        for i in 4..10 {
            assert!(!bf.get(i));
        }
        assert!(!bf.get(BITFIELD_PAGE_BITS * 3));
    }

    #[test]
    fn runs_and_counts() {
        let mut bf = Bitfield::in_memory();
        bf.set_range(2, 3, true);
        bf.set_range(10, 2, true);
        assert_eq!(bf.runs(0, 20), vec![(2, 3), (10, 2)]);
        assert_eq!(bf.runs(3, 11), vec![(3, 2), (10, 1)]);
        assert_eq!(bf.count_ones(0, 20), 5);
    }

    #[test]
    fn flush_and_reload() {
        let db = LogDb::open_temporary().unwrap();
        {
            let mut bf = Bitfield::open(db.bitfield_region()).unwrap();
            bf.set(1, true);
            bf.set(BITFIELD_PAGE_BITS + 7, true);
            bf.flush().unwrap();
        }
        let mut bf = Bitfield::open(db.bitfield_region()).unwrap();
        assert!(bf.get(1));
        assert!(bf.get(BITFIELD_PAGE_BITS + 7));
        assert!(!bf.get(2));

        bf.clear_from(0);
        bf.flush().unwrap();
        assert!(db.bitfield_region().is_empty());
    }
}
