//! Aligned page buffers.
//!
//! Native page contents live outside the regular `Vec` machinery so they
//! can be aligned for direct I/O and handed back to the
//! [`BufferAllocator`](super::BufferAllocator) when a page is evicted.

use std::alloc::{self, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;

/// A zero-initialized, fixed-capacity page buffer.
///
/// A recycled buffer keeps the bytes of its previous page; the loader
/// overwrites the whole page before publishing it.
///
/// # Example
///
/// ```rust
/// use pagecache_common::memory::AlignedBuffer;
///
/// let mut buffer = AlignedBuffer::new(8192, 4096);
/// buffer[0] = 42;
/// assert_eq!(buffer.len(), 8192);
/// assert_eq!(buffer.as_ptr() as usize % 4096, 0);
/// ```
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer exclusively owns its allocation
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocates `capacity` zeroed bytes aligned to `alignment`.
    ///
    /// # Panics
    ///
    /// Panics on a zero capacity or an alignment that is not a power of two.
    #[must_use]
    pub fn new(capacity: usize, alignment: usize) -> Self {
        assert!(capacity > 0, "page buffer capacity must be > 0");
        let layout = match Layout::from_size_align(capacity, alignment) {
            Ok(layout) => layout,
            Err(e) => panic!("bad page buffer layout {capacity}/{alignment}: {e}"),
        };

        // SAFETY: the layout is non-empty
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        match NonNull::new(raw) {
            Some(ptr) => Self { ptr, layout },
            None => alloc::handle_alloc_error(layout),
        }
    }

    /// Capacity in bytes; what the cache budget is charged for.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.layout.size()
    }

    /// Always false: buffers are never empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Alignment the buffer was allocated with.
    #[inline]
    #[must_use]
    pub const fn alignment(&self) -> usize {
        self.layout.align()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        // SAFETY: `len()` initialized bytes, shared borrow of self
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }
}

impl DerefMut for AlignedBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: `len()` initialized bytes, exclusive borrow of self
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AlignedBuffer({} bytes, align {})", self.len(), self.alignment())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_and_zeroing() {
        for alignment in [64, 512, 4096] {
            let buffer = AlignedBuffer::new(1000, alignment);
            assert_eq!(buffer.as_ptr() as usize % alignment, 0);
            assert_eq!(buffer.len(), 1000);
            assert_eq!(buffer.alignment(), alignment);
            assert!(buffer.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_page_round_trip() {
        let mut buffer = AlignedBuffer::new(512, 512);
        buffer[508..].copy_from_slice(&7u32.to_le_bytes());
        assert_eq!(u32::from_le_bytes(buffer[508..].try_into().unwrap()), 7);
    }

    #[test]
    #[should_panic(expected = "bad page buffer layout")]
    fn test_bad_alignment() {
        let _ = AlignedBuffer::new(128, 3);
    }
}
