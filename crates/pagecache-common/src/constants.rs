//! System-wide constants for the page cache.
//!
//! Most of these are defaults for fields of [`PageCacheConfig`] and
//! [`StorageConfig`]; a few are structural limits that are not configurable.
//!
//! [`PageCacheConfig`]: crate::config::PageCacheConfig
//! [`StorageConfig`]: crate::config::StorageConfig

// =============================================================================
// Page Constants
// =============================================================================

/// Default page size in bytes (64 KB).
pub const DEFAULT_PAGE_SIZE: usize = 64 * 1024;

/// Minimum page size in bytes (512 B).
pub const MIN_PAGE_SIZE: usize = 512;

/// Maximum page size in bytes (1 GB).
///
/// Offsets inside a page are tracked as `u32`, so a page can never be
/// larger than that.
pub const MAX_PAGE_SIZE: usize = 1 << 30;

/// Maximum number of concurrent users of a single page.
///
/// The usage count shares one 32-bit word with the page state, and takes the
/// low 24 bits of it.
pub const MAX_PAGE_USAGE_COUNT: u32 = (1 << 24) - 1;

// =============================================================================
// Usefulness Accounting
// =============================================================================

/// Tokens a page earns for every use observed by the housekeeper or on release.
pub const TOKENS_PER_USE: i32 = 8;

/// Tokens a freshly created page starts with.
pub const TOKENS_INITIALLY: i32 = 16;

// =============================================================================
// Eviction Constants
// =============================================================================

/// Default target percentile of pages to prepare for reclamation per turn.
pub const DEFAULT_MIN_RECLAIM_PERCENT: u32 = 10;

/// Upper bound of the target percentile under memory pressure.
pub const DEFAULT_MAX_RECLAIM_PERCENT: u32 = 20;

/// Pages a client thread may reclaim itself while allocating one page.
pub const MAX_PAGES_TO_RECLAIM_AT_ONCE: usize = 5;

/// Pages the housekeeper reclaims directly per turn when over capacity.
pub const MAX_PAGES_TO_RECLAIM_PER_TURN: usize = 10;

/// Storage close commands processed per housekeeper turn.
pub const CLOSE_COMMANDS_PER_TURN: usize = 1;

/// Fraction of the reclaim queue the housekeeper tries to keep clean.
pub const CLEAN_CANDIDATES_FRACTION: f64 = 0.5;

/// Housekeeper turns with failed flushes after which a storage close gives up.
pub const MAX_CLOSE_FLUSH_FAILURES: u32 = 16;

/// How long the housekeeper parks when its reclaim queue is barely consumed
/// (milliseconds).
pub const HOUSEKEEPER_PARK_MILLIS: u64 = 1;

/// How long the housekeeper parks when there is nothing to reclaim at all
/// (milliseconds). Registrations and close requests wake it early.
pub const HOUSEKEEPER_IDLE_PARK_MILLIS: u64 = 10;

/// Default name of the housekeeper thread.
pub const HOUSEKEEPER_THREAD_NAME: &str = "page-cache-housekeeper";

/// Default cache capacity (256 MB).
pub const DEFAULT_CACHE_CAPACITY: u64 = 256 * 1024 * 1024;

// =============================================================================
// Pages Table Constants
// =============================================================================

/// Initial number of slots in a storage's pages table.
pub const INITIAL_PAGES_TABLE_SIZE: usize = 32;

/// The table never shrinks below this number of slots.
pub const MIN_PAGES_TABLE_SIZE: usize = 16;

/// Occupied-slot ratio above which the table grows.
pub const PAGES_TABLE_LOAD_FACTOR: f64 = 0.4;

/// Growth multiplier applied on rehash.
pub const PAGES_TABLE_GROWTH_FACTOR: f64 = 1.5;

/// The table shrinks when live pages fit into a table this many times smaller.
pub const PAGES_TABLE_SHRINK_FACTOR: usize = 2;

// =============================================================================
// Buffer Allocator Constants
// =============================================================================

/// Alignment of pooled native buffers.
pub const BUFFER_ALIGNMENT: usize = 4096;

/// Default upper bound of bytes kept cached in the allocator (64 MB).
pub const DEFAULT_MAX_CACHED_BYTES: u64 = 64 * 1024 * 1024;

/// Default maximum number of buffers kept per size bucket.
pub const DEFAULT_MAX_BUFFERS_PER_BUCKET: usize = 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_limits() {
        assert!(MIN_PAGE_SIZE.is_power_of_two());
        assert!(MAX_PAGE_SIZE.is_power_of_two());
        assert!(DEFAULT_PAGE_SIZE >= MIN_PAGE_SIZE);
        assert!(DEFAULT_PAGE_SIZE <= MAX_PAGE_SIZE);
        assert!(u32::try_from(MAX_PAGE_SIZE).is_ok());
    }

    #[test]
    fn test_reclaim_percent_bounds() {
        assert!(DEFAULT_MIN_RECLAIM_PERCENT <= DEFAULT_MAX_RECLAIM_PERCENT);
        assert!(DEFAULT_MAX_RECLAIM_PERCENT <= 100);
        assert!(CLEAN_CANDIDATES_FRACTION > 0.0 && CLEAN_CANDIDATES_FRACTION <= 1.0);
    }

    #[test]
    fn test_table_sizes() {
        assert!(MIN_PAGES_TABLE_SIZE <= INITIAL_PAGES_TABLE_SIZE);
        assert!(PAGES_TABLE_LOAD_FACTOR < 1.0);
        assert!(PAGES_TABLE_GROWTH_FACTOR > 1.0);
    }
}
