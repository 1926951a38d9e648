//! # pagecache-storage
//!
//! Paged file storage on top of a bounded, self-evicting page cache.
//!
//! Files are presented as arrays of fixed-size pages. Many threads may read
//! and write pages concurrently; a single housekeeper thread per cache
//! decides which pages to evict and flush so that the memory held by cached
//! pages converges to the configured capacity.
//!
//! - [`PageCache`]: the shared cache and its housekeeper
//! - [`PagedStorage`]: per-file facade with primitive and bulk accessors
//! - [`ReliableChannel`]: positional I/O backend of a storage
//!
//! ## Example
//!
//! ```rust,no_run
//! use pagecache_common::config::{PageCacheConfig, StorageConfig};
//! use pagecache_storage::{PageCache, PagedStorage};
//!
//! fn example() -> pagecache_common::PageCacheResult<()> {
//!     let cache = PageCache::new(PageCacheConfig::new(64 * 1024 * 1024))?;
//!     let storage = PagedStorage::open("data.bin", StorageConfig::new(4096), &cache)?;
//!
//!     storage.put_long(16, 42)?;
//!     assert_eq!(storage.get_long(16)?, 42);
//!
//!     storage.close()?;
//!     cache.close()
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Page cache, housekeeper and eviction policy
pub mod cache;

/// Reliable positional I/O channels
pub mod file;

/// Page state machine, page guards and per-file page tables
pub mod page;

/// Paged storage facade
pub mod storage;

pub use cache::{CacheState, CloseFuture, PageCache, PageCacheStats, ThreadFactory};
pub use file::{FileChannel, MemoryChannel, ReliableChannel};
pub use page::{PageReadGuard, PageState, PageWriteGuard};
pub use storage::PagedStorage;
