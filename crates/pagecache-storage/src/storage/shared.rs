//! State of one storage shared between its facade, its pages and the cache.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use pagecache_common::config::StorageConfig;
use pagecache_common::types::{ByteOrder, StorageId};
use pagecache_common::{PageCacheError, PageCacheResult};

use crate::file::ReliableChannel;
use crate::page::PageToStorageHandle;

pub(crate) struct StorageShared {
    id: StorageId,
    path: PathBuf,
    channel: Box<dyn ReliableChannel>,
    config: StorageConfig,
    closed: AtomicBool,
    dirty_pages: AtomicUsize,
    /// Logical length: the larger of the channel size at open and the end of
    /// the furthest write since.
    length: AtomicU64,
}

impl StorageShared {
    pub(crate) fn new(
        channel: Box<dyn ReliableChannel>,
        config: StorageConfig,
    ) -> PageCacheResult<Self> {
        let path = channel.path().to_path_buf();
        let length = channel
            .size()
            .map_err(|e| PageCacheError::io(&path, e))?;
        Ok(Self {
            id: StorageId::allocate(),
            path,
            channel,
            config,
            closed: AtomicBool::new(false),
            dirty_pages: AtomicUsize::new(0),
            length: AtomicU64::new(length),
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> StorageId {
        self.id
    }

    #[inline]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub(crate) fn channel(&self) -> &dyn ReliableChannel {
        self.channel.as_ref()
    }

    #[inline]
    pub(crate) fn page_size(&self) -> usize {
        self.config.page_size
    }

    #[inline]
    pub(crate) fn byte_order(&self) -> ByteOrder {
        self.config.byte_order
    }

    #[inline]
    pub(crate) fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the storage closed. Returns true for the call that closed it.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn ensure_open(&self) -> PageCacheResult<()> {
        if self.is_closed() {
            return Err(PageCacheError::closed(&self.path));
        }
        Ok(())
    }

    pub(crate) fn ensure_writable(&self) -> PageCacheResult<()> {
        self.ensure_open()?;
        if self.is_read_only() {
            return Err(PageCacheError::read_only(&self.path));
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn dirty_pages(&self) -> usize {
        self.dirty_pages.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn length(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    fn raise_length(&self, end: u64) {
        let mut current = self.length.load(Ordering::Acquire);
        while end > current {
            match self.length.compare_exchange_weak(
                current,
                end,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

impl PageToStorageHandle for StorageShared {
    fn page_became_dirty(&self) {
        self.dirty_pages.fetch_add(1, Ordering::AcqRel);
    }

    fn page_became_clean(&self) {
        let previous = self.dirty_pages.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "{}: dirty page count underflow", self.path.display());
    }

    fn modified_region_updated(&self, start_offset_in_file: u64, len: usize) {
        self.raise_length(start_offset_in_file + len as u64);
    }

    fn flush_bytes(&self, data: &[u8], offset_in_file: u64) -> io::Result<()> {
        self.channel.write_all_at(data, offset_in_file)
    }
}

impl fmt::Debug for StorageShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageShared")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("page_size", &self.config.page_size)
            .field("closed", &self.is_closed())
            .field("dirty_pages", &self.dirty_pages())
            .field("length", &self.length())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryChannel;

    fn shared(read_only: bool) -> StorageShared {
        let mut config = StorageConfig::new(4096);
        config.read_only = read_only;
        let channel = MemoryChannel::with_content("mem.bin", vec![0; 100]);
        StorageShared::new(Box::new(channel), config).unwrap()
    }

    #[test]
    fn test_length_is_high_water_mark() {
        let shared = shared(false);
        assert_eq!(shared.length(), 100);
        shared.modified_region_updated(10, 20);
        assert_eq!(shared.length(), 100);
        shared.modified_region_updated(4096, 8);
        assert_eq!(shared.length(), 4104);
        shared.modified_region_updated(0, 1);
        assert_eq!(shared.length(), 4104);
    }

    #[test]
    fn test_close_once() {
        let shared = shared(false);
        assert!(shared.ensure_writable().is_ok());
        assert!(shared.mark_closed());
        assert!(!shared.mark_closed());
        assert!(shared.ensure_open().unwrap_err().is_closed_storage());
    }

    #[test]
    fn test_read_only() {
        let shared = shared(true);
        assert!(shared.ensure_open().is_ok());
        assert!(matches!(
            shared.ensure_writable(),
            Err(PageCacheError::ReadOnly { .. })
        ));
    }

    #[test]
    fn test_dirty_page_count() {
        let shared = shared(false);
        shared.page_became_dirty();
        shared.page_became_dirty();
        shared.page_became_clean();
        assert_eq!(shared.dirty_pages(), 1);
    }
}
