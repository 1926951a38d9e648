//! Page cache and buffer allocator configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::{
    BUFFER_ALIGNMENT, CLEAN_CANDIDATES_FRACTION, CLOSE_COMMANDS_PER_TURN, DEFAULT_CACHE_CAPACITY,
    DEFAULT_MAX_BUFFERS_PER_BUCKET, DEFAULT_MAX_CACHED_BYTES, DEFAULT_MAX_RECLAIM_PERCENT,
    DEFAULT_MIN_RECLAIM_PERCENT, HOUSEKEEPER_PARK_MILLIS, HOUSEKEEPER_THREAD_NAME,
    MAX_CLOSE_FLUSH_FAILURES, MAX_PAGES_TO_RECLAIM_AT_ONCE, MAX_PAGES_TO_RECLAIM_PER_TURN,
};
use crate::error::{PageCacheError, PageCacheResult};

/// Configuration of a page cache.
///
/// Only `capacity_bytes` is required in a TOML file; every other field falls
/// back to its default.
///
/// # Example
///
/// ```rust
/// use pagecache_common::config::PageCacheConfig;
///
/// let config = PageCacheConfig::new(64 * 1024 * 1024).with_reclaim_percent(5, 25);
/// assert!(config.validate().is_ok());
///
/// let parsed = PageCacheConfig::from_toml_str("capacity_bytes = 1048576").unwrap();
/// assert_eq!(parsed.capacity_bytes, 1024 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageCacheConfig {
    /// Soft upper bound of native bytes held by cached pages.
    pub capacity_bytes: u64,

    /// Name given to the housekeeper thread.
    #[serde(default = "default_thread_name")]
    pub housekeeper_thread_name: String,

    /// Lowest target percentile of pages prepared for reclamation.
    #[serde(default = "default_min_reclaim_percent")]
    pub min_reclaim_percent: u32,

    /// Highest target percentile, reached under sustained memory pressure.
    #[serde(default = "default_max_reclaim_percent")]
    pub max_reclaim_percent: u32,

    /// Pages a client thread may reclaim while allocating a single buffer.
    #[serde(default = "default_max_pages_to_reclaim_at_once")]
    pub max_pages_to_reclaim_at_once: usize,

    /// Pages the housekeeper reclaims per turn when the cache is over capacity.
    #[serde(default = "default_max_pages_to_reclaim_per_turn")]
    pub max_pages_to_reclaim_per_turn: usize,

    /// Storage close commands processed per housekeeper turn.
    #[serde(default = "default_close_commands_per_turn")]
    pub close_commands_per_turn: usize,

    /// Fraction of reclaim candidates the housekeeper tries to keep clean.
    #[serde(default = "default_clean_candidates_fraction")]
    pub clean_candidates_fraction: f64,

    /// Turns with failed flushes after which a storage close is reported failed.
    #[serde(default = "default_max_close_flush_failures")]
    pub max_close_flush_failures: u32,

    /// How long the housekeeper parks when idle, in milliseconds.
    #[serde(default = "default_park_millis")]
    pub housekeeper_park_millis: u64,

    /// Buffer allocator settings.
    #[serde(default)]
    pub allocator: BufferAllocatorConfig,
}

fn default_thread_name() -> String {
    HOUSEKEEPER_THREAD_NAME.to_string()
}

fn default_min_reclaim_percent() -> u32 {
    DEFAULT_MIN_RECLAIM_PERCENT
}

fn default_max_reclaim_percent() -> u32 {
    DEFAULT_MAX_RECLAIM_PERCENT
}

fn default_max_pages_to_reclaim_at_once() -> usize {
    MAX_PAGES_TO_RECLAIM_AT_ONCE
}

fn default_max_pages_to_reclaim_per_turn() -> usize {
    MAX_PAGES_TO_RECLAIM_PER_TURN
}

fn default_close_commands_per_turn() -> usize {
    CLOSE_COMMANDS_PER_TURN
}

fn default_clean_candidates_fraction() -> f64 {
    CLEAN_CANDIDATES_FRACTION
}

fn default_max_close_flush_failures() -> u32 {
    MAX_CLOSE_FLUSH_FAILURES
}

fn default_park_millis() -> u64 {
    HOUSEKEEPER_PARK_MILLIS
}

impl Default for PageCacheConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl PageCacheConfig {
    /// Creates a configuration with the given capacity and default tuning.
    #[must_use]
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            housekeeper_thread_name: default_thread_name(),
            min_reclaim_percent: DEFAULT_MIN_RECLAIM_PERCENT,
            max_reclaim_percent: DEFAULT_MAX_RECLAIM_PERCENT,
            max_pages_to_reclaim_at_once: MAX_PAGES_TO_RECLAIM_AT_ONCE,
            max_pages_to_reclaim_per_turn: MAX_PAGES_TO_RECLAIM_PER_TURN,
            close_commands_per_turn: CLOSE_COMMANDS_PER_TURN,
            clean_candidates_fraction: CLEAN_CANDIDATES_FRACTION,
            max_close_flush_failures: MAX_CLOSE_FLUSH_FAILURES,
            housekeeper_park_millis: HOUSEKEEPER_PARK_MILLIS,
            allocator: BufferAllocatorConfig::default(),
        }
    }

    /// Creates a small configuration for testing (4 MB).
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            allocator: BufferAllocatorConfig {
                max_cached_bytes: 1024 * 1024,
                ..Default::default()
            },
            ..Self::new(4 * 1024 * 1024)
        }
    }

    /// Sets the housekeeper thread name.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.housekeeper_thread_name = name.into();
        self
    }

    /// Sets the range of the reclaim target percentile.
    #[must_use]
    pub fn with_reclaim_percent(mut self, min: u32, max: u32) -> Self {
        self.min_reclaim_percent = min;
        self.max_reclaim_percent = max;
        self
    }

    /// Sets the clean-candidate fraction.
    #[must_use]
    pub fn with_clean_candidates_fraction(mut self, fraction: f64) -> Self {
        self.clean_candidates_fraction = fraction;
        self
    }

    /// Sets the buffer allocator configuration.
    #[must_use]
    pub fn with_allocator(mut self, allocator: BufferAllocatorConfig) -> Self {
        self.allocator = allocator;
        self
    }

    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> PageCacheResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> PageCacheResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| PageCacheError::io(path, e))?;
        Self::from_toml_str(&text)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> PageCacheResult<()> {
        if self.capacity_bytes == 0 {
            return Err(PageCacheError::config("capacity_bytes must be > 0"));
        }
        if self.min_reclaim_percent > self.max_reclaim_percent {
            return Err(PageCacheError::config(
                "min_reclaim_percent must not exceed max_reclaim_percent",
            ));
        }
        if self.max_reclaim_percent > 100 {
            return Err(PageCacheError::config("max_reclaim_percent must be <= 100"));
        }
        if self.max_pages_to_reclaim_at_once == 0 || self.max_pages_to_reclaim_per_turn == 0 {
            return Err(PageCacheError::config("page reclaim bounds must be > 0"));
        }
        if self.close_commands_per_turn == 0 {
            return Err(PageCacheError::config("close_commands_per_turn must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.clean_candidates_fraction) {
            return Err(PageCacheError::config(
                "clean_candidates_fraction must be within [0, 1]",
            ));
        }
        if self.housekeeper_thread_name.is_empty() {
            return Err(PageCacheError::config("housekeeper_thread_name must not be empty"));
        }
        self.allocator.validate()
    }
}

/// Configuration of the size-bucketed buffer allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferAllocatorConfig {
    /// Upper bound of bytes kept in the pool for reuse.
    #[serde(default = "default_max_cached_bytes")]
    pub max_cached_bytes: u64,

    /// Maximum number of buffers kept per size bucket.
    #[serde(default = "default_max_buffers_per_bucket")]
    pub max_buffers_per_bucket: usize,

    /// Alignment of allocated buffers. Must be a power of two.
    #[serde(default = "default_alignment")]
    pub alignment: usize,
}

fn default_max_cached_bytes() -> u64 {
    DEFAULT_MAX_CACHED_BYTES
}

fn default_max_buffers_per_bucket() -> usize {
    DEFAULT_MAX_BUFFERS_PER_BUCKET
}

fn default_alignment() -> usize {
    BUFFER_ALIGNMENT
}

impl Default for BufferAllocatorConfig {
    fn default() -> Self {
        Self {
            max_cached_bytes: DEFAULT_MAX_CACHED_BYTES,
            max_buffers_per_bucket: DEFAULT_MAX_BUFFERS_PER_BUCKET,
            alignment: BUFFER_ALIGNMENT,
        }
    }
}

impl BufferAllocatorConfig {
    /// Creates an allocator configuration that never caches freed buffers.
    #[must_use]
    pub fn without_pooling() -> Self {
        Self {
            max_cached_bytes: 0,
            ..Self::default()
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> PageCacheResult<()> {
        if !self.alignment.is_power_of_two() {
            return Err(PageCacheError::config("allocator alignment must be a power of 2"));
        }
        if self.max_buffers_per_bucket == 0 {
            return Err(PageCacheError::config("max_buffers_per_bucket must be > 0"));
        }
        Ok(())
    }
}
