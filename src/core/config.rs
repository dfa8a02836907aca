//! Mount configuration
//!
//! Every option has a default, so a TOML file only lists what it changes:
//!
//! ```toml
//! read_write = true
//! cache_size_bytes = 8388608
//!
//! [compression]
//! method = "lz4"
//! access_age_threshold_secs = 600.0
//!
//! [zones]
//! hot = 64.0
//! ```

use crate::allocator::AllocationStrategy;
use crate::compression::{CompressionMethod, DEFAULT_ACCESS_AGE_THRESHOLD};
use crate::error::{PixelMapError, Result};
use crate::predictor::DEFAULT_HISTORY_SIZE;
use crate::prefetch::{DEFAULT_PREFETCH_CACHE_SIZE, DEFAULT_PREFETCH_WINDOW};
use crate::superblock::CLUSTER_SIZE;
use crate::zone::ZoneThresholds;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_CACHE_SIZE_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    pub method: CompressionMethod,
    pub level: i32,
    pub access_age_threshold_secs: f64,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        CompressionSettings {
            method: CompressionMethod::Zstd,
            level: 3,
            access_age_threshold_secs: DEFAULT_ACCESS_AGE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchSettings {
    pub window_secs: f64,
    pub cache_size_bytes: usize,
}

impl Default for PrefetchSettings {
    fn default() -> Self {
        PrefetchSettings {
            window_secs: DEFAULT_PREFETCH_WINDOW,
            cache_size_bytes: DEFAULT_PREFETCH_CACHE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Allow create/write/unlink/rename/truncate
    pub read_write: bool,

    /// Prefetch worker threads
    pub workers: usize,

    /// Cluster cache size in bytes
    pub cache_size_bytes: usize,

    /// Access timestamps kept per path
    pub history_size: usize,

    pub allocation: AllocationStrategy,
    pub zones: ZoneThresholds,
    pub compression: CompressionSettings,
    pub prefetch: PrefetchSettings,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            read_write: false,
            workers: DEFAULT_WORKERS,
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            history_size: DEFAULT_HISTORY_SIZE,
            allocation: AllocationStrategy::default(),
            zones: ZoneThresholds::default(),
            compression: CompressionSettings::default(),
            prefetch: PrefetchSettings::default(),
        }
    }
}

impl MountConfig {
    /// Default configuration with writes enabled
    pub fn read_write() -> Self {
        MountConfig {
            read_write: true,
            ..Default::default()
        }
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: MountConfig =
            toml::from_str(source).map_err(|e| PixelMapError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PixelMapError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PixelMapError::Config("workers must be at least 1".to_string()));
        }

        if self.cache_size_bytes < CLUSTER_SIZE {
            return Err(PixelMapError::Config(format!(
                "cache_size_bytes ({}) must hold at least one {}-byte cluster",
                self.cache_size_bytes, CLUSTER_SIZE
            )));
        }

        if self.history_size < 2 {
            return Err(PixelMapError::Config(format!(
                "history_size ({}) must be at least 2",
                self.history_size
            )));
        }

        self.zones.validate()?;

        let compression = &self.compression;
        if compression.method == CompressionMethod::Zstd
            && !(1..=22).contains(&compression.level)
        {
            return Err(PixelMapError::Config(format!(
                "zstd level {} outside 1..=22",
                compression.level
            )));
        }
        let age = compression.access_age_threshold_secs;
        if age.is_nan() || age < 0.0 {
            return Err(PixelMapError::Config(
                "access_age_threshold_secs must be non-negative".to_string(),
            ));
        }

        if self.prefetch.window_secs.is_nan() || self.prefetch.window_secs < 0.0 {
            return Err(PixelMapError::Config(
                "prefetch window_secs must be non-negative".to_string(),
            ));
        }
        if self.prefetch.cache_size_bytes == 0 {
            return Err(PixelMapError::Config(
                "prefetch cache_size_bytes must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
