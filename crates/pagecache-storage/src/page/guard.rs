//! Page guards for several accesses to one page.
//!
//! A guard keeps its page acquired (usage count held) and releases it when
//! dropped, so the page can't be evicted while the guard is alive.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use pagecache_common::types::PageIndex;
use pagecache_common::{PageCacheError, PageCacheResult};

use super::page::Page;
use crate::storage::StorageShared;

fn check_range(page: &Page, offset: usize, len: usize) -> PageCacheResult<()> {
    let page_size = page.page_size();
    match offset.checked_add(len) {
        Some(end) if end <= page_size => Ok(()),
        _ => Err(PageCacheError::PageBoundary {
            offset: page.offset_in_file() + offset as u64,
            len,
            page_size,
        }),
    }
}

/// Read guard for an acquired page.
///
/// Offsets passed to the accessors are relative to the start of the page.
pub struct PageReadGuard {
    page: Arc<Page>,
    storage: Arc<StorageShared>,
}

impl PageReadGuard {
    /// Wraps a page the caller has already acquired.
    pub(crate) fn new(page: Arc<Page>, storage: Arc<StorageShared>) -> Self {
        Self { page, storage }
    }

    /// Returns the page index.
    #[inline]
    pub fn index(&self) -> PageIndex {
        self.page.index()
    }

    /// Returns the page size in bytes.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page.page_size()
    }

    /// Returns true if the page holds unflushed modifications.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.page.is_dirty()
    }

    /// Returns the page content.
    #[inline]
    pub fn data(&self) -> impl Deref<Target = [u8]> + '_ {
        self.page.content()
    }

    /// Reads one byte.
    pub fn get_byte(&self, offset: usize) -> PageCacheResult<u8> {
        read_byte(&self.page, offset)
    }

    /// Reads an `i32` in the storage byte order.
    pub fn get_int(&self, offset: usize) -> PageCacheResult<i32> {
        read_int(&self.page, &self.storage, offset)
    }

    /// Reads an `i64` in the storage byte order.
    pub fn get_long(&self, offset: usize) -> PageCacheResult<i64> {
        read_long(&self.page, &self.storage, offset)
    }

    /// Copies `dst.len()` bytes starting at `offset` into `dst`.
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> PageCacheResult<()> {
        read_into(&self.page, offset, dst)
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        self.page.release();
    }
}

impl fmt::Debug for PageReadGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageReadGuard")
            .field("index", &self.page.index())
            .field("storage", &self.storage.path())
            .finish()
    }
}

/// Write guard for an acquired page of a writable storage.
///
/// Every write records the modified range, so the page becomes dirty and the
/// storage length grows to cover it.
pub struct PageWriteGuard {
    page: Arc<Page>,
    storage: Arc<StorageShared>,
}

impl PageWriteGuard {
    /// Wraps a page the caller has already acquired.
    pub(crate) fn new(page: Arc<Page>, storage: Arc<StorageShared>) -> Self {
        debug_assert!(!storage.is_read_only());
        Self { page, storage }
    }

    /// Returns the page index.
    #[inline]
    pub fn index(&self) -> PageIndex {
        self.page.index()
    }

    /// Returns the page size in bytes.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page.page_size()
    }

    /// Returns true if the page holds unflushed modifications.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.page.is_dirty()
    }

    /// Returns the page content.
    #[inline]
    pub fn data(&self) -> impl Deref<Target = [u8]> + '_ {
        self.page.content()
    }

    /// Reads one byte.
    pub fn get_byte(&self, offset: usize) -> PageCacheResult<u8> {
        read_byte(&self.page, offset)
    }

    /// Reads an `i32` in the storage byte order.
    pub fn get_int(&self, offset: usize) -> PageCacheResult<i32> {
        read_int(&self.page, &self.storage, offset)
    }

    /// Reads an `i64` in the storage byte order.
    pub fn get_long(&self, offset: usize) -> PageCacheResult<i64> {
        read_long(&self.page, &self.storage, offset)
    }

    /// Copies `dst.len()` bytes starting at `offset` into `dst`.
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> PageCacheResult<()> {
        read_into(&self.page, offset, dst)
    }

    /// Writes one byte.
    pub fn put_byte(&mut self, offset: usize, value: u8) -> PageCacheResult<()> {
        self.with_bytes_mut(offset, 1, |bytes| bytes[0] = value)
    }

    /// Writes an `i32` in the storage byte order.
    pub fn put_int(&mut self, offset: usize, value: i32) -> PageCacheResult<()> {
        let order = self.storage.byte_order();
        self.with_bytes_mut(offset, 4, |bytes| order.put_i32(bytes, value))
    }

    /// Writes an `i64` in the storage byte order.
    pub fn put_long(&mut self, offset: usize, value: i64) -> PageCacheResult<()> {
        let order = self.storage.byte_order();
        self.with_bytes_mut(offset, 8, |bytes| order.put_i64(bytes, value))
    }

    /// Copies `src` into the page starting at `offset`.
    pub fn write_bytes(&mut self, offset: usize, src: &[u8]) -> PageCacheResult<()> {
        self.with_bytes_mut(offset, src.len(), |bytes| bytes.copy_from_slice(src))
    }

    /// Runs `f` over `len` mutable bytes at `offset`; the range is marked
    /// modified whether or not `f` changes it.
    pub fn with_bytes_mut<R>(
        &mut self,
        offset: usize,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> PageCacheResult<R> {
        check_range(&self.page, offset, len)?;
        Ok(self
            .page
            .write_content(offset, len, &*self.storage, f))
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        self.page.release();
    }
}

impl fmt::Debug for PageWriteGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageWriteGuard")
            .field("index", &self.page.index())
            .field("storage", &self.storage.path())
            .field("dirty", &self.page.is_dirty())
            .finish()
    }
}

fn read_byte(page: &Page, offset: usize) -> PageCacheResult<u8> {
    check_range(page, offset, 1)?;
    Ok(page.read_content(offset, 1, |bytes| bytes[0]))
}

fn read_int(page: &Page, storage: &StorageShared, offset: usize) -> PageCacheResult<i32> {
    check_range(page, offset, 4)?;
    let order = storage.byte_order();
    Ok(page.read_content(offset, 4, |bytes| order.get_i32(bytes)))
}

fn read_long(page: &Page, storage: &StorageShared, offset: usize) -> PageCacheResult<i64> {
    check_range(page, offset, 8)?;
    let order = storage.byte_order();
    Ok(page.read_content(offset, 8, |bytes| order.get_i64(bytes)))
}

fn read_into(page: &Page, offset: usize, dst: &mut [u8]) -> PageCacheResult<()> {
    check_range(page, offset, dst.len())?;
    page.read_content(offset, dst.len(), |bytes| dst.copy_from_slice(bytes));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryChannel;
    use crate::page::buffer::PageBuffer;
    use crate::page::Acquire;
    use pagecache_common::config::StorageConfig;
    use pagecache_common::types::ByteOrder;

    fn acquired_page(storage: &StorageShared, index: u32) -> Arc<Page> {
        let page = Arc::new(Page::new(PageIndex::new(index), 512, storage.id()));
        assert!(page.try_start_loading());
        page.finish_loading(PageBuffer::heap(512));
        assert_eq!(page.try_acquire_for_use(), Acquire::Acquired);
        page
    }

    fn storage(order: ByteOrder) -> Arc<StorageShared> {
        let config = StorageConfig::new(512).with_byte_order(order);
        Arc::new(StorageShared::new(Box::new(MemoryChannel::new("g.bin")), config).unwrap())
    }

    #[test]
    fn test_write_guard_round_trip() {
        let storage = storage(ByteOrder::BigEndian);
        let page = acquired_page(&storage, 1);
        {
            let mut guard = PageWriteGuard::new(Arc::clone(&page), Arc::clone(&storage));
            guard.put_int(0, 0x0102_0304).unwrap();
            guard.put_long(8, -2).unwrap();
            guard.put_byte(511, 7).unwrap();
            assert!(guard.is_dirty());
            assert_eq!(guard.get_int(0).unwrap(), 0x0102_0304);
            assert_eq!(&guard.data()[..4], &[1, 2, 3, 4]);
            assert_eq!(guard.get_long(8).unwrap(), -2);
            assert_eq!(guard.get_byte(511).unwrap(), 7);
        }
        assert_eq!(page.usage_count(), 0);
        assert_eq!(storage.dirty_pages(), 1);
        assert_eq!(storage.length(), 1024);
    }

    #[test]
    fn test_read_guard_releases_on_drop() {
        let storage = storage(ByteOrder::Native);
        let page = acquired_page(&storage, 0);
        let guard = PageReadGuard::new(Arc::clone(&page), Arc::clone(&storage));
        assert_eq!(page.usage_count(), 1);
        let mut dst = [1u8; 16];
        guard.read_bytes(100, &mut dst).unwrap();
        assert_eq!(dst, [0u8; 16]);
        drop(guard);
        assert_eq!(page.usage_count(), 0);
    }

    #[test]
    fn test_out_of_page_access() {
        let storage = storage(ByteOrder::Native);
        let page = acquired_page(&storage, 2);
        let mut guard = PageWriteGuard::new(page, Arc::clone(&storage));
        match guard.put_int(510, 1) {
            Err(PageCacheError::PageBoundary {
                offset,
                len,
                page_size,
            }) => {
                assert_eq!(offset, 1024 + 510);
                assert_eq!(len, 4);
                assert_eq!(page_size, 512);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(guard.get_long(505).is_err());
        assert!(!guard.is_dirty());
    }
}
