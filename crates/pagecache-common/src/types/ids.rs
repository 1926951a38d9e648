//! Identifier types for pages and storages.
//!
//! These types provide type-safe wrappers around numeric identifiers,
//! preventing accidental mixing of page numbers and storage handles.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Index of a page inside one storage.
///
/// Page `n` covers the byte range `[n * page_size, (n + 1) * page_size)` of
/// the underlying file.
///
/// # Example
///
/// ```rust
/// use pagecache_common::types::PageIndex;
///
/// let index = PageIndex::new(42);
/// assert_eq!(index.as_u32(), 42);
/// assert_eq!(index.offset_in_file(4096), 42 * 4096);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PageIndex(u32);

impl PageIndex {
    /// First page of a storage.
    pub const FIRST: Self = Self(0);

    /// Creates a new `PageIndex` from a raw u32 value.
    #[inline]
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the file offset of the first byte of this page.
    #[inline]
    #[must_use]
    pub const fn offset_in_file(self, page_size: usize) -> u64 {
        self.0 as u64 * page_size as u64
    }

    /// Returns the page containing the given file offset, if it is addressable.
    #[inline]
    #[must_use]
    pub fn containing(offset: u64, page_size: usize) -> Option<Self> {
        u32::try_from(offset / page_size as u64).ok().map(Self)
    }
}

impl fmt::Debug for PageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageIndex({})", self.0)
    }
}

impl fmt::Display for PageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PageIndex {
    #[inline]
    fn from(index: u32) -> Self {
        Self::new(index)
    }
}

impl From<PageIndex> for u32 {
    #[inline]
    fn from(index: PageIndex) -> Self {
        index.0
    }
}

/// Process-unique identifier of an open storage.
///
/// Pages remember their owner by this id rather than by a reference, so a
/// page never keeps its storage alive.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct StorageId(u64);

static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

impl StorageId {
    /// Creates a new `StorageId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocates a fresh id, never returned before in this process.
    #[must_use]
    pub fn allocate() -> Self {
        Self(NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageId({})", self.0)
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_index_offsets() {
        let index = PageIndex::new(3);
        assert_eq!(index.offset_in_file(4096), 12288);
        assert_eq!(
            PageIndex::new(u32::MAX).offset_in_file(1 << 20),
            u64::from(u32::MAX) << 20
        );
    }

    #[test]
    fn test_page_index_containing() {
        assert_eq!(PageIndex::containing(0, 4096), Some(PageIndex::FIRST));
        assert_eq!(PageIndex::containing(4095, 4096), Some(PageIndex::new(0)));
        assert_eq!(PageIndex::containing(4096, 4096), Some(PageIndex::new(1)));
        assert_eq!(PageIndex::containing(u64::MAX, 512), None);
    }

    #[test]
    fn test_storage_ids_are_unique() {
        let a = StorageId::allocate();
        let b = StorageId::allocate();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", PageIndex::new(7)), "7");
        assert_eq!(format!("{:?}", StorageId::new(9)), "StorageId(9)");
    }
}
