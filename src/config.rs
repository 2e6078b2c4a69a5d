//! Cache Configuration
//!
//! Sizing knobs for the block cache and the index cache. Loaded from YAML
//! and overridden from the command line by the binary.
//!
//! ```yaml
//! block_size: 65536
//! cache_capacity_bytes: 33554432
//! index_cache_capacity_bytes: 16777216
//! concurrency_shard_count: 32
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default block size (64KB)
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024;

/// Default block cache capacity (32MB)
pub const DEFAULT_CACHE_CAPACITY: u64 = 32 * 1024 * 1024;

/// Default index cache capacity (16MB)
pub const DEFAULT_INDEX_CACHE_CAPACITY: u64 = 16 * 1024 * 1024;

/// Default number of lock shards
pub const DEFAULT_SHARD_COUNT: usize = 32;

/// Smallest block size accepted
pub const MIN_BLOCK_SIZE: u64 = 512;

/// Block and index cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Size of one cached block in bytes (power of two)
    pub block_size: u64,
    /// Byte budget for resident blocks
    pub cache_capacity_bytes: u64,
    /// Byte budget for parsed pack and bitmap indexes
    pub index_cache_capacity_bytes: u64,
    /// Number of lock shards (power of two)
    pub concurrency_shard_count: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            cache_capacity_bytes: DEFAULT_CACHE_CAPACITY,
            index_cache_capacity_bytes: DEFAULT_INDEX_CACHE_CAPACITY,
            concurrency_shard_count: DEFAULT_SHARD_COUNT,
        }
    }
}

impl CacheConfig {
    /// Parse a configuration from YAML, then validate it
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Builder-style block size override
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    /// Builder-style block capacity override
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.cache_capacity_bytes = capacity;
        self
    }

    /// Builder-style index capacity override
    pub fn with_index_capacity(mut self, capacity: u64) -> Self {
        self.index_cache_capacity_bytes = capacity;
        self
    }

    /// Builder-style shard count override
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.concurrency_shard_count = shards;
        self
    }

    /// Check that the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two() || self.block_size < MIN_BLOCK_SIZE {
            return Err(Error::Config(format!(
                "block_size must be a power of two >= {}, got {}",
                MIN_BLOCK_SIZE, self.block_size
            )));
        }
        if self.block_size > u32::MAX as u64 {
            return Err(Error::Config(format!(
                "block_size {} does not fit a single backend read",
                self.block_size
            )));
        }
        if self.concurrency_shard_count == 0 || !self.concurrency_shard_count.is_power_of_two() {
            return Err(Error::Config(format!(
                "concurrency_shard_count must be a non-zero power of two, got {}",
                self.concurrency_shard_count
            )));
        }
        if self.cache_capacity_bytes < self.block_size {
            return Err(Error::Config(format!(
                "cache_capacity_bytes ({}) is smaller than one block ({})",
                self.cache_capacity_bytes, self.block_size
            )));
        }
        Ok(())
    }

    /// Block number containing `offset`
    #[inline]
    pub fn block_number(&self, offset: u64) -> u64 {
        offset / self.block_size
    }

    /// First byte of block `block`
    #[inline]
    pub fn block_start(&self, block: u64) -> u64 {
        block * self.block_size
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_config_is_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.block_size, 64 * 1024);
        assert_eq!(config.concurrency_shard_count, 32);
    }

    #[test]
    fn test_rejects_bad_block_size() {
        let config = CacheConfig::default().with_block_size(1000);
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let config = CacheConfig::default().with_block_size(256);
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_rejects_bad_shard_count() {
        assert_matches!(
            CacheConfig::default().with_shards(0).validate(),
            Err(Error::Config(_))
        );
        assert_matches!(
            CacheConfig::default().with_shards(3).validate(),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_rejects_capacity_below_one_block() {
        let config = CacheConfig::default().with_block_size(4096).with_capacity(1024);
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_yaml_partial_uses_defaults() {
        let config = CacheConfig::from_yaml_str("block_size: 4096\nconcurrency_shard_count: 4\n")
            .unwrap();
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.concurrency_shard_count, 4);
        assert_eq!(config.cache_capacity_bytes, DEFAULT_CACHE_CAPACITY);
    }

    #[test]
    fn test_yaml_invalid_values_rejected() {
        assert_matches!(
            CacheConfig::from_yaml_str("block_size: 3000\n"),
            Err(Error::Config(_))
        );
        assert_matches!(
            CacheConfig::from_yaml_str("block_size: [1, 2]\n"),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_block_arithmetic() {
        let config = CacheConfig::default().with_block_size(4096);
        assert_eq!(config.block_number(0), 0);
        assert_eq!(config.block_number(4095), 0);
        assert_eq!(config.block_number(4096), 1);
        assert_eq!(config.block_start(3), 12288);
    }
}
