//! Configuration for tiercache
//!
//! Centralized configuration with sensible defaults and named presets.

use std::time::Duration;

use crate::error::{CacheError, Result};

/// Main configuration for a cache instance
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    // -------------------------------------------------------------------------
    // Sharding
    // -------------------------------------------------------------------------
    /// Number of independent shards. Fixed for the lifetime of an instance.
    pub shard_count: usize,

    // -------------------------------------------------------------------------
    // Value Handling
    // -------------------------------------------------------------------------
    /// Compress values with the configured codec before storing them
    pub compression_enabled: bool,

    /// Re-write values found in level 2 into the active table on read
    pub locality_enabled: bool,

    /// Advisory memory cap in bytes. Only reported against, never enforced.
    pub max_memory_bytes: Option<u64>,

    // -------------------------------------------------------------------------
    // Active Table Sizing
    // -------------------------------------------------------------------------
    /// Metadata slots per active table
    pub active_table_slots: usize,

    /// Key + value bytes per active table
    pub active_table_bytes: usize,

    // -------------------------------------------------------------------------
    // Background Workers
    // -------------------------------------------------------------------------
    /// Idle wait of the level 0 merger when nothing is eligible
    pub level0_idle: Duration,

    /// Idle wait of the level 1 merger when nothing is eligible
    pub level1_idle: Duration,

    /// Sampling period of the memory statistics collector
    pub stats_interval: Duration,

    /// Records fetched per batch from each level 1 merge source
    pub read_ahead: usize,
}

impl CacheConfig {
    /// One shard, for tests and small embedded use
    pub const SMALL: CacheConfig = CacheConfig::preset(1);
    pub const DEFAULT: CacheConfig = CacheConfig::preset(4);
    pub const BIG: CacheConfig = CacheConfig::preset(8);
    pub const LARGE: CacheConfig = CacheConfig::preset(16);
    pub const HUGE: CacheConfig = CacheConfig::preset(32);

    /// Default slot count per active table
    pub const DEFAULT_ACTIVE_SLOTS: usize = 128 * 1024;

    /// Default data bytes per active table
    pub const DEFAULT_ACTIVE_BYTES: usize = 128 * 1024 * 1024;

    const fn preset(shard_count: usize) -> Self {
        Self {
            shard_count,
            compression_enabled: true,
            locality_enabled: false,
            max_memory_bytes: None,
            active_table_slots: Self::DEFAULT_ACTIVE_SLOTS,
            active_table_bytes: Self::DEFAULT_ACTIVE_BYTES,
            level0_idle: Duration::from_secs(2),
            level1_idle: Duration::from_secs(5),
            stats_interval: Duration::from_secs(5),
            read_ahead: 32,
        }
    }

    /// Create a new config builder starting from [`CacheConfig::DEFAULT`]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check that the configuration can back a live cache
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(CacheError::Config("shard_count must be at least 1".into()));
        }
        if self.active_table_slots == 0 {
            return Err(CacheError::Config(
                "active_table_slots must be at least 1".into(),
            ));
        }
        if self.active_table_bytes < 2 {
            return Err(CacheError::Config(
                "active_table_bytes must hold at least one key and value byte".into(),
            ));
        }
        if self.read_ahead == 0 {
            return Err(CacheError::Config("read_ahead must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Builder for CacheConfig
#[derive(Default)]
pub struct ConfigBuilder {
    config: CacheConfig,
}

impl ConfigBuilder {
    /// Start from a named preset instead of the default
    pub fn from_preset(preset: CacheConfig) -> Self {
        Self { config: preset }
    }

    /// Set the shard count
    pub fn shard_count(mut self, count: usize) -> Self {
        self.config.shard_count = count;
        self
    }

    /// Enable or disable value compression
    pub fn compression_enabled(mut self, enabled: bool) -> Self {
        self.config.compression_enabled = enabled;
        self
    }

    /// Enable or disable level 2 read promotion
    pub fn locality_enabled(mut self, enabled: bool) -> Self {
        self.config.locality_enabled = enabled;
        self
    }

    /// Set the advisory memory cap (in bytes)
    pub fn max_memory_bytes(mut self, bytes: u64) -> Self {
        self.config.max_memory_bytes = Some(bytes);
        self
    }

    /// Set the metadata slot capacity of each active table
    pub fn active_table_slots(mut self, slots: usize) -> Self {
        self.config.active_table_slots = slots;
        self
    }

    /// Set the data byte capacity of each active table
    pub fn active_table_bytes(mut self, bytes: usize) -> Self {
        self.config.active_table_bytes = bytes;
        self
    }

    /// Set the level 0 merger idle wait
    pub fn level0_idle(mut self, idle: Duration) -> Self {
        self.config.level0_idle = idle;
        self
    }

    /// Set the level 1 merger idle wait
    pub fn level1_idle(mut self, idle: Duration) -> Self {
        self.config.level1_idle = idle;
        self
    }

    /// Set the memory statistics sampling period
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.config.stats_interval = interval;
        self
    }

    /// Set the per-source read-ahead of level 1 merges
    pub fn read_ahead(mut self, records: usize) -> Self {
        self.config.read_ahead = records;
        self
    }

    pub fn build(self) -> CacheConfig {
        self.config
    }
}
