//! Page cache statistics for monitoring and debugging.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the cache, its storages and the housekeeper.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    turns_done: AtomicU64,
    turns_skipped: AtomicU64,
    pages_allocated_native: AtomicU64,
    pages_allocated_heap: AtomicU64,
    pages_reclaimed_native: AtomicU64,
    pages_reclaimed_heap: AtomicU64,
    pages_loaded: AtomicU64,
    pages_acquired: AtomicU64,
    eager_flushes: AtomicU64,
    storages_closed: AtomicU64,
    flush_failures: AtomicU64,
}

impl StatsCounters {
    #[inline]
    pub(crate) fn record_turn(&self) {
        self.turns_done.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_skipped_turn(&self) {
        self.turns_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_allocation(&self, native: bool) {
        let counter = if native {
            &self.pages_allocated_native
        } else {
            &self.pages_allocated_heap
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_reclaim(&self, native: bool) {
        let counter = if native {
            &self.pages_reclaimed_native
        } else {
            &self.pages_reclaimed_heap
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_load(&self) {
        self.pages_loaded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_acquire(&self) {
        self.pages_acquired.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_eager_flush(&self) {
        self.eager_flushes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_storage_closed(&self) {
        self.storages_closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, native_bytes: u64, heap_bytes: u64) -> PageCacheStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        PageCacheStats {
            turns_done: load(&self.turns_done),
            turns_skipped: load(&self.turns_skipped),
            pages_allocated_native: load(&self.pages_allocated_native),
            pages_allocated_heap: load(&self.pages_allocated_heap),
            pages_reclaimed_native: load(&self.pages_reclaimed_native),
            pages_reclaimed_heap: load(&self.pages_reclaimed_heap),
            pages_loaded: load(&self.pages_loaded),
            pages_acquired: load(&self.pages_acquired),
            eager_flushes: load(&self.eager_flushes),
            storages_closed: load(&self.storages_closed),
            flush_failures: load(&self.flush_failures),
            native_bytes,
            heap_bytes,
        }
    }
}

/// Point-in-time copy of the cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCacheStats {
    /// Housekeeper turns that did work.
    pub turns_done: u64,
    /// Housekeeper wake-ups that found nothing to do.
    pub turns_skipped: u64,
    /// Pages given a pooled native buffer.
    pub pages_allocated_native: u64,
    /// Pages given a heap buffer because the cache was over capacity.
    pub pages_allocated_heap: u64,
    /// Native-buffer pages evicted.
    pub pages_reclaimed_native: u64,
    /// Heap-buffer pages evicted.
    pub pages_reclaimed_heap: u64,
    /// Pages read from their channel.
    pub pages_loaded: u64,
    /// Successful page acquisitions.
    pub pages_acquired: u64,
    /// Dirty pages flushed ahead of eviction by the housekeeper.
    pub eager_flushes: u64,
    /// Closed storages whose pages were all reclaimed.
    pub storages_closed: u64,
    /// Failed page flushes during housekeeping or close.
    pub flush_failures: u64,
    /// Bytes currently held in native page buffers.
    pub native_bytes: u64,
    /// Bytes currently held in heap page buffers.
    pub heap_bytes: u64,
}

impl PageCacheStats {
    /// Total bytes held by cached pages.
    pub fn resident_bytes(&self) -> u64 {
        self.native_bytes + self.heap_bytes
    }

    /// Total pages evicted.
    pub fn pages_reclaimed(&self) -> u64 {
        self.pages_reclaimed_native + self.pages_reclaimed_heap
    }

    /// Fraction of allocations that had to fall back to the heap (0.0 to 1.0).
    pub fn heap_allocation_ratio(&self) -> f64 {
        let total = self.pages_allocated_native + self.pages_allocated_heap;
        if total == 0 {
            0.0
        } else {
            self.pages_allocated_heap as f64 / total as f64
        }
    }
}

impl fmt::Display for PageCacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PageCacheStats {{ turns: {} (+{} skipped), allocated: {} native / {} heap, reclaimed: {} native / {} heap, loaded: {}, resident: {} bytes, flush failures: {} }}",
            self.turns_done,
            self.turns_skipped,
            self.pages_allocated_native,
            self.pages_allocated_heap,
            self.pages_reclaimed_native,
            self.pages_reclaimed_heap,
            self.pages_loaded,
            self.resident_bytes(),
            self.flush_failures
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let counters = StatsCounters::default();
        counters.record_allocation(true);
        counters.record_allocation(true);
        counters.record_allocation(false);
        counters.record_reclaim(true);
        counters.record_reclaim(false);
        counters.record_turn();

        let stats = counters.snapshot(8192, 4096);
        assert_eq!(stats.pages_allocated_native, 2);
        assert_eq!(stats.pages_allocated_heap, 1);
        assert_eq!(stats.pages_reclaimed(), 2);
        assert_eq!(stats.turns_done, 1);
        assert_eq!(stats.resident_bytes(), 12288);
        assert!((stats.heap_allocation_ratio() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_display() {
        let stats = PageCacheStats::default();
        let text = stats.to_string();
        assert!(text.contains("turns: 0"));
        assert!(text.contains("resident: 0 bytes"));
    }
}
