//! Error handling for the page cache.
//!
//! This module provides the error type and result alias shared by the
//! common and storage crates.

mod cache;

pub use cache::{ErrorCode, PageCacheError};

/// Result type alias for page cache operations.
pub type PageCacheResult<T> = std::result::Result<T, PageCacheError>;
