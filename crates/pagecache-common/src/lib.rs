//! # pagecache-common
//!
//! Common types, errors, configuration and memory utilities for the page cache.
//!
//! This crate provides the foundational pieces shared by the storage layer:
//!
//! - **Types**: Page and storage identifiers (`PageIndex`, `StorageId`) and `ByteOrder`
//! - **Errors**: Unified error handling with `PageCacheError`
//! - **Config**: `PageCacheConfig`, `StorageConfig` and `BufferAllocatorConfig`
//! - **Memory**: Aligned page buffers and the size-bucketed `BufferAllocator`
//! - **Constants**: Tuning constants of the eviction engine
//!
//! ## Example
//!
//! ```rust
//! use pagecache_common::config::StorageConfig;
//! use pagecache_common::types::PageIndex;
//! use pagecache_common::error::PageCacheResult;
//!
//! fn example() -> PageCacheResult<()> {
//!     let config = StorageConfig::new(4096);
//!     config.validate()?;
//!     let index = PageIndex::new(3);
//!     assert_eq!(index.offset_in_file(config.page_size), 3 * 4096);
//!     Ok(())
//! }
//! # example().unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod constants;
pub mod error;
pub mod memory;
pub mod types;

// Re-export commonly used items at the crate root
pub use constants::*;
pub use error::{PageCacheError, PageCacheResult};
pub use types::{ByteOrder, PageIndex, StorageId};
