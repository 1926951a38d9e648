//! Configuration for the page cache.
//!
//! [`PageCacheConfig`] is shared by every storage registered in one cache;
//! [`StorageConfig`] describes a single paged file.

mod cache;
mod storage;

pub use cache::{BufferAllocatorConfig, PageCacheConfig};
pub use storage::StorageConfig;
