//! Scheduler configuration.
//!
//! Exactly the knobs spec.md §6 recognizes: `cache_block_size`,
//! `pool_low_water`, `pool_high_water`, and `ip_high_watermark`. Loaded
//! from a TOML file or built programmatically; validated eagerly so a
//! misconfigured pool never makes it past startup.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, SchedulerError};

/// Default fraction of `pool_high_water` at which the background writer
/// starts preferring IP service over draining the working set
/// (spec.md §4.5).
pub const DEFAULT_IP_HIGH_WATERMARK: f64 = 0.6;

/// Factor by which outstanding DP requests must exceed cache-waiters for
/// the writer to prefer DP service over IP (spec.md §4.5).
pub const DP_PREFERENCE_FACTOR: usize = 2;

/// Scheduler configuration, recognized from `{cache_block_size,
/// pool_low_water, pool_high_water, ip_high_watermark}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Cache block size in bytes. Must equal the volume's nominal tape
    /// block size; the CRC tail (4 bytes) is added on top of this value
    /// when cache blocks are allocated.
    pub cache_block_size: usize,

    /// Pool low-water mark, in cache blocks (steady-state capacity).
    pub pool_low_water: usize,

    /// Pool high-water mark, in cache blocks (hard cap).
    pub pool_high_water: usize,

    /// Fraction of `pool_high_water` at which IP usage is considered
    /// "high" for writer-policy purposes.
    pub ip_high_watermark: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cache_block_size: 64 * 1024,
            pool_low_water: 64,
            pool_high_water: 512,
            ip_high_watermark: DEFAULT_IP_HIGH_WATERMARK,
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// any field the file does not specify.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SchedulerError::InvalidArg(format!("reading config file: {e}"))
        })?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| SchedulerError::InvalidArg(format!("parsing config file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, matching the invariants implied by
    /// spec.md §3/§4.1 (`low_water <= high_water`, nonzero power-of-two
    /// block size, watermark fraction in `(0, 1]`).
    pub fn validate(&self) -> Result<()> {
        if self.cache_block_size == 0 || !self.cache_block_size.is_power_of_two() {
            return Err(SchedulerError::InvalidArg(
                "cache_block_size must be a nonzero power of two".into(),
            ));
        }
        if self.pool_low_water > self.pool_high_water {
            return Err(SchedulerError::InvalidArg(
                "pool_low_water must be <= pool_high_water".into(),
            ));
        }
        if self.pool_high_water == 0 {
            return Err(SchedulerError::InvalidArg(
                "pool_high_water must be > 0".into(),
            ));
        }
        if !(self.ip_high_watermark > 0.0 && self.ip_high_watermark <= 1.0) {
            return Err(SchedulerError::InvalidArg(
                "ip_high_watermark must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_block_size() {
        let mut config = SchedulerConfig::default();
        config.cache_block_size = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_watermarks() {
        let mut config = SchedulerConfig::default();
        config.pool_low_water = 10;
        config.pool_high_water = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_ip_watermark() {
        let mut config = SchedulerConfig::default();
        config.ip_high_watermark = 0.0;
        assert!(config.validate().is_err());

        config.ip_high_watermark = 1.5;
        assert!(config.validate().is_err());
    }
}
