//! Per-storage table of cached pages.
//!
//! Open addressing with linear probing, keyed by page index. The structural
//! lock protects only the slot array and is never held across I/O or while a
//! page is being accessed. Tombstoned pages keep their slot until it is
//! reused by an insert or dropped by a rehash.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use pagecache_common::constants::{
    INITIAL_PAGES_TABLE_SIZE, MIN_PAGES_TABLE_SIZE, PAGES_TABLE_GROWTH_FACTOR,
    PAGES_TABLE_LOAD_FACTOR, PAGES_TABLE_SHRINK_FACTOR,
};
use pagecache_common::types::PageIndex;
use parking_lot::RwLock;
use tracing::debug;

use super::page::Page;
use crate::storage::StorageShared;

#[inline]
fn mix(index: PageIndex) -> usize {
    let h = index.as_u32().wrapping_mul(0x9E37_79B9);
    (h ^ (h >> 16)) as usize
}

struct Slots {
    pages: Vec<Option<Arc<Page>>>,
    /// Non-empty slots, tombstones included.
    occupied: usize,
}

impl Slots {
    fn with_len(len: usize) -> Self {
        let mut pages = Vec::with_capacity(len);
        pages.resize_with(len, || None);
        Self { pages, occupied: 0 }
    }

    fn len(&self) -> usize {
        self.pages.len()
    }

    /// Finds the live page with `index`, probing from its home slot.
    fn find(&self, index: PageIndex) -> Option<&Arc<Page>> {
        let len = self.len();
        let home = mix(index) % len;
        for probe in 0..len {
            match &self.pages[(home + probe) % len] {
                None => return None,
                Some(page) if page.index() == index && !page.is_tombstone() => return Some(page),
                Some(_) => {}
            }
        }
        None
    }

    /// Returns the live page with `index` or the slot to insert it into: the
    /// first tombstone on the probe path, else the terminating empty slot.
    fn find_or_slot(&self, index: PageIndex) -> Result<Arc<Page>, Option<usize>> {
        let len = self.len();
        let home = mix(index) % len;
        let mut reusable = None;
        for probe in 0..len {
            let slot = (home + probe) % len;
            match &self.pages[slot] {
                None => return Err(reusable.or(Some(slot))),
                Some(page) if page.is_tombstone() => {
                    if reusable.is_none() {
                        reusable = Some(slot);
                    }
                }
                Some(page) if page.index() == index => return Ok(Arc::clone(page)),
                Some(_) => {}
            }
        }
        Err(reusable)
    }

    /// Rebuilds the array with `new_len` slots, dropping tombstones.
    fn rehash(&mut self, new_len: usize) {
        let new_len = new_len.max(MIN_PAGES_TABLE_SIZE);
        let old = std::mem::take(&mut self.pages);
        *self = Self::with_len(new_len);
        for page in old.into_iter().flatten() {
            if page.is_tombstone() {
                continue;
            }
            let home = mix(page.index()) % new_len;
            let slot = (0..new_len)
                .map(|probe| (home + probe) % new_len)
                .find(|&slot| self.pages[slot].is_none());
            match slot {
                Some(slot) => {
                    self.pages[slot] = Some(page);
                    self.occupied += 1;
                }
                None => panic!("pages table of {new_len} slots overflowed on rehash"),
            }
        }
    }
}

/// Pages of one storage, keyed by page index.
pub(crate) struct PagesTable {
    storage: Arc<StorageShared>,
    slots: RwLock<Slots>,
}

impl PagesTable {
    pub(crate) fn new(storage: Arc<StorageShared>) -> Self {
        let initial = (INITIAL_PAGES_TABLE_SIZE as f64 / PAGES_TABLE_LOAD_FACTOR) as usize;
        Self {
            storage,
            slots: RwLock::new(Slots::with_len(initial.max(MIN_PAGES_TABLE_SIZE))),
        }
    }

    /// Returns the storage the pages belong to.
    #[inline]
    pub(crate) fn storage(&self) -> &Arc<StorageShared> {
        &self.storage
    }

    /// Returns the non-tombstone page with `index`, if cached.
    pub(crate) fn lookup_if_exists(&self, index: PageIndex) -> Option<Arc<Page>> {
        self.slots.read().find(index).cloned()
    }

    /// Returns the non-tombstone page with `index`, inserting the page made
    /// by `factory` if there is none.
    pub(crate) fn lookup_or_create(
        &self,
        index: PageIndex,
        factory: impl FnOnce() -> Page,
    ) -> Arc<Page> {
        if let Some(page) = self.lookup_if_exists(index) {
            return page;
        }

        let mut slots = self.slots.write();
        let slot = match slots.find_or_slot(index) {
            Ok(page) => return page,
            Err(Some(slot)) => slot,
            Err(None) => panic!(
                "pages table of {} is full ({} slots)",
                self.storage.path().display(),
                slots.len()
            ),
        };

        let page = Arc::new(factory());
        debug_assert_eq!(page.index(), index);
        if slots.pages[slot].is_none() {
            slots.occupied += 1;
        }
        slots.pages[slot] = Some(Arc::clone(&page));

        if slots.occupied as f64 > slots.len() as f64 * PAGES_TABLE_LOAD_FACTOR {
            let new_len = (slots.occupied as f64 / PAGES_TABLE_LOAD_FACTOR
                * PAGES_TABLE_GROWTH_FACTOR) as usize;
            debug!(
                storage = %self.storage.path().display(),
                from = slots.len(),
                to = new_len,
                "growing pages table"
            );
            slots.rehash(new_len);
        }
        page
    }

    /// Shrinks the table if `alive_pages` would fit into one at least twice
    /// smaller.
    pub(crate) fn shrink_if_needed(&self, alive_pages: usize) {
        let expected = (alive_pages as f64 / PAGES_TABLE_LOAD_FACTOR) as usize;
        if expected < MIN_PAGES_TABLE_SIZE {
            return;
        }
        let mut slots = self.slots.write();
        if expected * PAGES_TABLE_SHRINK_FACTOR < slots.len() {
            debug!(
                storage = %self.storage.path().display(),
                from = slots.len(),
                to = expected,
                "shrinking pages table"
            );
            slots.rehash(expected);
        }
    }

    /// Snapshot of all non-tombstone pages.
    pub(crate) fn pages(&self) -> Vec<Arc<Page>> {
        self.slots
            .read()
            .pages
            .iter()
            .flatten()
            .filter(|page| !page.is_tombstone())
            .cloned()
            .collect()
    }

    /// Flushes every dirty page. Returns the number of pages written.
    pub(crate) fn flush_all(&self) -> io::Result<usize> {
        let mut flushed = 0;
        for page in self.pages() {
            if page.is_dirty() && page.flush(&*self.storage)? {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Number of slots.
    pub(crate) fn capacity(&self) -> usize {
        self.slots.read().len()
    }

    /// Number of non-empty slots, tombstones included.
    pub(crate) fn occupied(&self) -> usize {
        self.slots.read().occupied
    }

    /// Histogram `probe length -> number of pages` for live pages.
    pub(crate) fn probe_lengths_histogram(&self) -> BTreeMap<usize, usize> {
        let slots = self.slots.read();
        let len = slots.len();
        let mut histogram = BTreeMap::new();
        for (slot, page) in slots.pages.iter().enumerate() {
            let Some(page) = page else { continue };
            if page.is_tombstone() {
                continue;
            }
            let home = mix(page.index()) % len;
            let probe = (slot + len - home) % len;
            *histogram.entry(probe).or_insert(0) += 1;
        }
        histogram
    }
}

impl fmt::Debug for PagesTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagesTable")
            .field("storage", &self.storage.path())
            .field("capacity", &self.capacity())
            .field("occupied", &self.occupied())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryChannel;
    use crate::page::buffer::PageBuffer;
    use crate::page::PageState;
    use pagecache_common::config::StorageConfig;

    fn table() -> PagesTable {
        let config = StorageConfig::new(512);
        let shared = StorageShared::new(Box::new(MemoryChannel::new("t.bin")), config).unwrap();
        PagesTable::new(Arc::new(shared))
    }

    fn create(table: &PagesTable, index: u32) -> Arc<Page> {
        let owner = table.storage().id();
        table.lookup_or_create(PageIndex::new(index), || {
            Page::new(PageIndex::new(index), 512, owner)
        })
    }

    fn kill(page: &Page) {
        assert!(page.try_move_towards_pre_tombstone(true));
        page.entomb();
    }

    #[test]
    fn test_initial_capacity() {
        let table = table();
        assert_eq!(table.capacity(), 80);
        assert_eq!(table.occupied(), 0);
        assert!(table.lookup_if_exists(PageIndex::new(3)).is_none());
    }

    #[test]
    fn test_lookup_or_create_is_idempotent() {
        let table = table();
        let first = create(&table, 7);
        let second = create(&table, 7);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.occupied(), 1);
        let found = table.lookup_if_exists(PageIndex::new(7)).unwrap();
        assert!(Arc::ptr_eq(&first, &found));
    }

    #[test]
    fn test_tombstone_is_replaced() {
        let table = table();
        let old = create(&table, 3);
        kill(&old);
        assert!(table.lookup_if_exists(PageIndex::new(3)).is_none());

        let fresh = create(&table, 3);
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(fresh.state(), PageState::NotReady);
        assert_eq!(table.occupied(), 1);
    }

    #[test]
    fn test_grows_and_keeps_pages() {
        let table = table();
        for index in 0..500 {
            create(&table, index);
        }
        assert!(table.capacity() as f64 * PAGES_TABLE_LOAD_FACTOR >= 500.0);
        for index in 0..500 {
            assert!(table.lookup_if_exists(PageIndex::new(index)).is_some());
        }
        assert_eq!(table.pages().len(), 500);
        let probed: usize = table.probe_lengths_histogram().values().sum();
        assert_eq!(probed, 500);
    }

    #[test]
    fn test_shrink_drops_tombstones() {
        let table = table();
        let pages: Vec<_> = (0..500).map(|index| create(&table, index)).collect();
        for page in &pages[10..] {
            kill(page);
        }
        let grown = table.capacity();
        table.shrink_if_needed(10);
        assert!(table.capacity() < grown);
        assert_eq!(table.occupied(), 10);
        for index in 0..10 {
            assert!(table.lookup_if_exists(PageIndex::new(index)).is_some());
        }
    }

    #[test]
    fn test_shrink_keeps_minimum() {
        let table = table();
        table.shrink_if_needed(1);
        assert_eq!(table.capacity(), 80);
    }

    #[test]
    fn test_flush_all_writes_dirty_pages() {
        let table = table();
        let page = create(&table, 1);
        assert!(page.try_start_loading());
        page.finish_loading(PageBuffer::heap(512));
        page.write_content(0, 4, &**table.storage(), |bytes| bytes.fill(9));
        assert_eq!(table.storage().dirty_pages(), 1);

        assert_eq!(table.flush_all().unwrap(), 1);
        assert_eq!(table.storage().dirty_pages(), 0);
        assert_eq!(table.flush_all().unwrap(), 0);
    }
}
