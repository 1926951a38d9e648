//! Per-storage configuration.

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::error::{PageCacheError, PageCacheResult};
use crate::types::ByteOrder;

/// Configuration of one paged storage.
///
/// The page size is fixed for the lifetime of the storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Size of each page in bytes. Must be a power of 2.
    pub page_size: usize,

    /// Byte order of multi-byte values.
    #[serde(default)]
    pub byte_order: ByteOrder,

    /// Open the file read-only; every write fails.
    #[serde(default)]
    pub read_only: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl StorageConfig {
    /// Creates a writable, native-order configuration with the given page size.
    #[must_use]
    pub const fn new(page_size: usize) -> Self {
        Self {
            page_size,
            byte_order: ByteOrder::Native,
            read_only: false,
        }
    }

    /// Sets the byte order.
    #[must_use]
    pub const fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Marks the storage read-only.
    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> PageCacheResult<()> {
        if !self.page_size.is_power_of_two() {
            return Err(PageCacheError::config("page_size must be a power of 2"));
        }
        if self.page_size < MIN_PAGE_SIZE {
            return Err(PageCacheError::config(format!(
                "page_size must be >= {MIN_PAGE_SIZE}"
            )));
        }
        if self.page_size > MAX_PAGE_SIZE {
            return Err(PageCacheError::config(format!(
                "page_size must be <= {MAX_PAGE_SIZE}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = StorageConfig::new(4096)
            .with_byte_order(ByteOrder::BigEndian)
            .read_only();
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.byte_order, ByteOrder::BigEndian);
        assert!(config.read_only);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_page_size_validation() {
        assert!(StorageConfig::new(MIN_PAGE_SIZE).validate().is_ok());
        assert!(StorageConfig::new(MIN_PAGE_SIZE / 2).validate().is_err());
        assert!(StorageConfig::new(5000).validate().is_err());
        assert!(StorageConfig::new(MAX_PAGE_SIZE * 2).validate().is_err());
    }

    #[test]
    fn test_deserialize_defaults() {
        let config: StorageConfig = toml::from_str("page_size = 8192").unwrap();
        assert_eq!(config, StorageConfig::new(8192));

        let config: StorageConfig =
            toml::from_str("page_size = 8192\nbyte_order = \"big_endian\"").unwrap();
        assert_eq!(config.byte_order, ByteOrder::BigEndian);
    }
}
