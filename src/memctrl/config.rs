use anyhow::ensure;
use serde::Deserialize;

use crate::fabric::types::WORD_BYTES;
use crate::sim::config::Config;
use crate::timeq::Cycle;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub sets: usize,
    pub ways: usize,
    pub block_bytes: u32,
    /// Cycles from issuing a backing-store access to its acknowledgment.
    pub backing_latency: Cycle,
}

impl Config for CacheConfig {}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sets: 16,
            ways: 4,
            // one 512-bit line per backing-store transfer
            block_bytes: 64,
            backing_latency: 2,
        }
    }
}

impl CacheConfig {
    pub fn ensure_valid(&self) -> anyhow::Result<()> {
        ensure!(self.sets.is_power_of_two(), "sets must be a power of two, got {}", self.sets);
        ensure!(self.ways > 0, "ways must be > 0");
        ensure!(
            self.block_bytes.is_power_of_two() && self.block_bytes >= WORD_BYTES,
            "block_bytes must be a power of two of at least one word, got {}",
            self.block_bytes
        );
        ensure!(self.backing_latency >= 1, "backing_latency must be >= 1");
        Ok(())
    }

    pub fn words_per_block(&self) -> usize {
        (self.block_bytes / WORD_BYTES) as usize
    }

    pub fn capacity_bytes(&self) -> usize {
        self.sets * self.ways * self.block_bytes as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = CacheConfig::default();
        config.ensure_valid().unwrap();
        assert_eq!(16, config.words_per_block());
        assert_eq!(4096, config.capacity_bytes());
    }

    #[test]
    fn non_power_of_two_geometry_is_rejected() {
        let config = CacheConfig {
            sets: 12,
            ..CacheConfig::default()
        };
        assert!(config.ensure_valid().is_err());
        let config = CacheConfig {
            block_bytes: 2,
            ..CacheConfig::default()
        };
        assert!(config.ensure_valid().is_err());
    }
}
