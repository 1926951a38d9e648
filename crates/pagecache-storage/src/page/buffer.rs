//! Page content buffers.

use std::fmt;

use pagecache_common::memory::AlignedBuffer;

/// Memory holding the content of one page.
///
/// Native buffers come from the cache's allocator and count towards its
/// capacity. Heap buffers are the overflow path used when the cache could
/// not free enough native memory in time. They count towards the resident
/// total, so the housekeeper keeps evicting until it is back under capacity.
pub(crate) enum PageBuffer {
    Native(AlignedBuffer),
    Heap(Box<[u8]>),
}

impl PageBuffer {
    /// Allocates a zeroed heap buffer.
    pub(crate) fn heap(size: usize) -> Self {
        Self::Heap(vec![0u8; size].into_boxed_slice())
    }

    /// Number of bytes the buffer occupies, which may exceed the page size.
    pub(crate) fn capacity(&self) -> usize {
        match self {
            Self::Native(buffer) => buffer.len(),
            Self::Heap(buffer) => buffer.len(),
        }
    }

    pub(crate) fn is_native(&self) -> bool {
        matches!(self, Self::Native(_))
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            Self::Native(buffer) => buffer,
            Self::Heap(buffer) => buffer,
        }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Self::Native(buffer) => buffer,
            Self::Heap(buffer) => buffer,
        }
    }
}

impl fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_native() { "Native" } else { "Heap" };
        write!(f, "PageBuffer::{kind}({} bytes)", self.capacity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_buffer() {
        let mut buffer = PageBuffer::heap(512);
        assert!(!buffer.is_native());
        assert_eq!(buffer.capacity(), 512);
        buffer.as_mut_slice()[0] = 1;
        assert_eq!(buffer.as_slice()[0], 1);
    }

    #[test]
    fn test_native_buffer() {
        let buffer = PageBuffer::Native(AlignedBuffer::new(1024, 64));
        assert!(buffer.is_native());
        assert_eq!(buffer.capacity(), 1024);
        assert_eq!(format!("{buffer:?}"), "PageBuffer::Native(1024 bytes)");
    }
}
