//! Page cache error types.
//!
//! Invariant violations of the page state machine are not represented here:
//! they are programming errors and panic at the point of detection.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Error codes for categorizing errors.
///
/// These codes can be used for programmatic error handling and
/// are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// I/O failure reported by a channel.
    Io = 0x0100,
    /// Storage was closed before or during the operation.
    ClosedStorage = 0x0200,
    /// Write attempted on a read-only storage.
    ReadOnly = 0x0201,
    /// Access does not fit into a single page.
    PageBoundary = 0x0202,
    /// The path is already open in the cache.
    AlreadyRegistered = 0x0203,
    /// Closing a storage did not complete.
    CloseFailed = 0x0204,
    /// The page cache itself was shut down.
    CacheClosed = 0x0300,
    /// Invalid configuration.
    InvalidConfig = 0x0400,
}

impl ErrorCode {
    /// Returns the category name of this error code.
    #[must_use]
    pub const fn category(self) -> &'static str {
        match (self as u16) >> 8 {
            0x01 => "IO",
            0x02 => "Storage",
            0x03 => "Cache",
            0x04 => "Config",
            _ => "Unknown",
        }
    }
}

/// Errors that can occur during page cache operations.
#[derive(Debug, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum PageCacheError {
    /// The storage is closed; every access after close fails with this.
    #[error("storage {path} is closed")]
    ClosedStorage { path: PathBuf },

    /// A write was attempted on a storage opened read-only.
    #[error("storage {path} is read-only")]
    ReadOnly { path: PathBuf },

    /// A primitive access straddles a page boundary or leaves the page.
    #[error("access of {len} bytes at offset {offset} crosses a page boundary (page size {page_size})")]
    PageBoundary {
        offset: u64,
        len: usize,
        page_size: usize,
    },

    /// I/O error while loading or flushing a page.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// I/O error not attributed to a particular file.
    #[error("I/O error: {0}")]
    RawIo(#[from] io::Error),

    /// The same path is already registered in the page cache.
    #[error("storage {path} is already open in this page cache")]
    AlreadyRegistered { path: PathBuf },

    /// Storage close gave up before all pages were written back.
    #[error("failed to close storage {path}: {reason}")]
    CloseFailed { path: PathBuf, reason: String },

    /// The page cache has been shut down.
    #[error("page cache is closed")]
    CacheClosed,

    /// Configuration error.
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl PageCacheError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an I/O error attributed to `path`.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Creates a closed-storage error.
    pub fn closed(path: impl AsRef<Path>) -> Self {
        Self::ClosedStorage {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Creates a read-only error.
    pub fn read_only(path: impl AsRef<Path>) -> Self {
        Self::ReadOnly {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Returns the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::ClosedStorage { .. } => ErrorCode::ClosedStorage,
            Self::ReadOnly { .. } => ErrorCode::ReadOnly,
            Self::PageBoundary { .. } => ErrorCode::PageBoundary,
            Self::Io { .. } | Self::RawIo(_) => ErrorCode::Io,
            Self::AlreadyRegistered { .. } => ErrorCode::AlreadyRegistered,
            Self::CloseFailed { .. } => ErrorCode::CloseFailed,
            Self::CacheClosed => ErrorCode::CacheClosed,
            Self::Config { .. } | Self::ConfigParse(_) => ErrorCode::InvalidConfig,
        }
    }

    /// Returns true if this is a transient error that can be retried.
    ///
    /// A failed page load leaves no trace in the cache, so the same access
    /// may succeed once the channel recovers.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::RawIo(_))
    }

    /// Returns true if the storage can no longer be used.
    pub fn is_closed_storage(&self) -> bool {
        matches!(self, Self::ClosedStorage { .. } | Self::CacheClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = PageCacheError::closed("/tmp/data.bin");
        assert!(matches!(
            err,
            PageCacheError::ClosedStorage { ref path } if path == Path::new("/tmp/data.bin")
        ));
        assert_eq!(err.to_string(), "storage /tmp/data.bin is closed");
    }

    #[test]
    fn test_error_code() {
        let err = PageCacheError::read_only("a");
        assert_eq!(err.code(), ErrorCode::ReadOnly);
        assert_eq!(err.code().category(), "Storage");
        assert_eq!(PageCacheError::CacheClosed.code().category(), "Cache");
        assert_eq!(PageCacheError::config("x").code().category(), "Config");
    }

    #[test]
    fn test_is_retryable() {
        let err = PageCacheError::io("a", io::Error::new(io::ErrorKind::Other, "disk"));
        assert!(err.is_retryable());
        assert!(!PageCacheError::closed("a").is_retryable());
        assert!(PageCacheError::closed("a").is_closed_storage());
    }

    #[test]
    fn test_from_io() {
        let err: PageCacheError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.code(), ErrorCode::Io);
    }
}
