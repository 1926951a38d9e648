//! Size-bucketed buffer allocator.
//!
//! Page buffers are expensive to allocate and are allocated and freed at a
//! high rate by page eviction, so freed buffers are kept in per-capacity
//! buckets and handed out again.
//!
//! # Design
//!
//! - One lock-free bounded queue per buffer capacity (`ArrayQueue`)
//! - A request for `size` bytes is served by a bucket in `[size, 2 * size]`
//! - Buckets are created on demand and never removed
//! - A global budget caps the bytes kept in buckets; buffers beyond it are
//!   freed immediately

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use parking_lot::RwLock;
use tracing::trace;

use super::aligned::AlignedBuffer;
use crate::config::BufferAllocatorConfig;

type Bucket = Arc<ArrayQueue<AlignedBuffer>>;

/// Recycling allocator for native page buffers.
///
/// # Example
///
/// ```rust
/// use pagecache_common::config::BufferAllocatorConfig;
/// use pagecache_common::memory::BufferAllocator;
///
/// let allocator = BufferAllocator::new(BufferAllocatorConfig::default());
///
/// let buffer = allocator.allocate(4096);
/// assert!(buffer.len() >= 4096);
/// allocator.release(buffer);
///
/// // The freed buffer is reused for the next request of a similar size.
/// let _again = allocator.allocate(3000);
/// assert_eq!(allocator.stats().hits, 1);
/// ```
pub struct BufferAllocator {
    config: BufferAllocatorConfig,
    buckets: RwLock<BTreeMap<usize, Bucket>>,
    hits: AtomicU64,
    misses: AtomicU64,
    reclaimed: AtomicU64,
    disposed: AtomicU64,
    cached_bytes: AtomicU64,
    allocated_bytes: AtomicU64,
}

impl BufferAllocator {
    /// Creates a new allocator.
    #[must_use]
    pub fn new(config: BufferAllocatorConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(BTreeMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            disposed: AtomicU64::new(0),
            cached_bytes: AtomicU64::new(0),
            allocated_bytes: AtomicU64::new(0),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &BufferAllocatorConfig {
        &self.config
    }

    /// Returns a buffer of at least `size` bytes.
    ///
    /// Reused buffers keep their previous content; callers overwrite the
    /// part they use.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    #[must_use]
    pub fn allocate(&self, size: usize) -> AlignedBuffer {
        if let Some(buffer) = self.take_cached(size) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.cached_bytes
                .fetch_sub(buffer.len() as u64, Ordering::Relaxed);
            return buffer;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let buffer = AlignedBuffer::new(size, self.config.alignment);
        self.allocated_bytes
            .fetch_add(buffer.len() as u64, Ordering::Relaxed);
        buffer
    }

    /// Returns a buffer to the pool, or frees it if the pool is full.
    pub fn release(&self, buffer: AlignedBuffer) {
        let capacity = buffer.len();
        let budget = self.config.max_cached_bytes;
        if self.cached_bytes.load(Ordering::Relaxed) + capacity as u64 > budget {
            self.dispose(buffer);
            return;
        }

        let bucket = self.bucket_for(capacity);
        match bucket.push(buffer) {
            Ok(()) => {
                self.reclaimed.fetch_add(1, Ordering::Relaxed);
                self.cached_bytes
                    .fetch_add(capacity as u64, Ordering::Relaxed);
            }
            Err(buffer) => self.dispose(buffer),
        }
    }

    /// Frees every cached buffer. Buckets themselves stay.
    pub fn clear(&self) {
        let buckets = self.buckets.read();
        let mut freed = 0usize;
        for bucket in buckets.values() {
            while let Some(buffer) = bucket.pop() {
                self.cached_bytes
                    .fetch_sub(buffer.len() as u64, Ordering::Relaxed);
                self.dispose(buffer);
                freed += 1;
            }
        }
        trace!(freed, "buffer allocator cleared");
    }

    /// Returns a snapshot of the allocator counters.
    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            disposed: self.disposed.load(Ordering::Relaxed),
            cached_bytes: self.cached_bytes.load(Ordering::Relaxed),
            allocated_bytes: self.allocated_bytes.load(Ordering::Relaxed),
            buckets: self.buckets.read().len(),
        }
    }

    fn take_cached(&self, size: usize) -> Option<AlignedBuffer> {
        assert!(size > 0, "size must be greater than 0");
        let buckets = self.buckets.read();
        buckets
            .range(size..=size.saturating_mul(2))
            .find_map(|(_, bucket)| bucket.pop())
    }

    fn bucket_for(&self, capacity: usize) -> Bucket {
        if let Some(bucket) = self.buckets.read().get(&capacity) {
            return Arc::clone(bucket);
        }
        let mut buckets = self.buckets.write();
        let depth = self.config.max_buffers_per_bucket;
        Arc::clone(
            buckets
                .entry(capacity)
                .or_insert_with(|| Arc::new(ArrayQueue::new(depth))),
        )
    }

    fn dispose(&self, buffer: AlignedBuffer) {
        self.disposed.fetch_add(1, Ordering::Relaxed);
        self.allocated_bytes
            .fetch_sub(buffer.len() as u64, Ordering::Relaxed);
        drop(buffer);
    }
}

impl fmt::Debug for BufferAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferAllocator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Snapshot of [`BufferAllocator`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Requests served from a bucket.
    pub hits: u64,
    /// Requests that needed a fresh allocation.
    pub misses: u64,
    /// Buffers returned to a bucket.
    pub reclaimed: u64,
    /// Buffers freed instead of cached.
    pub disposed: u64,
    /// Bytes currently sitting in buckets.
    pub cached_bytes: u64,
    /// Bytes allocated and not yet freed, cached or handed out.
    pub allocated_bytes: u64,
    /// Number of size buckets.
    pub buckets: usize,
}

impl AllocatorStats {
    /// Returns the bucket hit ratio (0.0 to 1.0).
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl fmt::Display for AllocatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={}, misses={}, hit_ratio={:.2}%, reclaimed={}, disposed={}, cached={}B, allocated={}B",
            self.hits,
            self.misses,
            self.hit_ratio() * 100.0,
            self.reclaimed,
            self.disposed,
            self.cached_bytes,
            self.allocated_bytes
        )
    }
}
