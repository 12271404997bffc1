use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use crate::compute::UnitStatus;
use crate::memctrl::CacheStats;
use crate::timeq::Cycle;

#[derive(Debug, Clone, Serialize)]
pub struct UnitSummary {
    pub unit: usize,
    pub activations: u64,
    pub completions: u64,
    pub status: UnitStatus,
    pub grants: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DestSummary {
    pub name: String,
    /// Grants per source, CPU last.
    pub grants: Vec<u64>,
}

/// End-of-run counters for the whole fabric.
#[derive(Debug, Clone, Serialize)]
pub struct FabricStats {
    pub cycles: Cycle,
    pub units: Vec<UnitSummary>,
    pub cpu_grants: u64,
    pub cpu_completions: usize,
    pub destinations: Vec<DestSummary>,
    pub decode_faults: Vec<u64>,
    pub cache: CacheStats,
    pub hit_rate: f64,
}

impl FabricStats {
    pub fn total_grants(&self) -> u64 {
        self.destinations.iter().flat_map(|d| d.grants.iter()).sum()
    }

    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        let payload = serde_json::to_string_pretty(self).context("cannot serialize stats")?;
        fs::write(path, payload).with_context(|| format!("cannot write {}", path.display()))
    }
}
