use std::sync::Arc;

use crate::base::behavior::ModuleBehaviors;
use crate::fabric::config::FabricConfig;
use crate::memctrl::CacheConfig;
use crate::sim::config::SimConfig;
use crate::sim::top::Fabric;

pub const CPU: usize = 8;

pub fn fabric_with(cache: CacheConfig) -> Fabric {
    Fabric::new(
        Arc::new(FabricConfig::default()),
        Arc::new(cache),
        &SimConfig::default(),
    )
    .unwrap()
}

pub fn default_fabric() -> Fabric {
    fabric_with(CacheConfig::default())
}

/// One set, one way, 16-byte blocks.
pub fn tiny_cache() -> CacheConfig {
    CacheConfig {
        sets: 1,
        ways: 1,
        block_bytes: 16,
        backing_latency: 2,
    }
}

/// Tick until the scalar port drains; returns the cycles taken.
pub fn drain_cpu(fabric: &mut Fabric) -> u64 {
    fabric.run_until(1_000, |f| f.cpu().idle()).unwrap()
}

pub fn tick(fabric: &mut Fabric, cycles: u64) {
    (0..cycles).for_each(|_| fabric.tick_one());
}
