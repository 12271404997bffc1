use anyhow::{bail, ensure};
use serde::Deserialize;

use crate::fabric::crossbar::AddressMap;
use crate::fabric::types::Addr;
use crate::sim::config::Config;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    /// Served by the cached memory controller.
    Memory,
    /// Served by a plain word-storage register target.
    Registers,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RegionConfig {
    pub name: String,
    pub base: Addr,
    pub size: u32,
    pub kind: RegionKind,
}

impl RegionConfig {
    pub fn new(name: &str, base: Addr, size: u32, kind: RegionKind) -> Self {
        Self {
            name: name.to_string(),
            base,
            size,
            kind,
        }
    }

    pub fn end(&self) -> u64 {
        self.base as u64 + self.size as u64
    }

    pub fn contains(&self, addr: Addr) -> bool {
        addr >= self.base && (addr as u64) < self.end()
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FabricConfig {
    pub num_units: usize,
    pub regions: Vec<RegionConfig>,
}

impl Config for FabricConfig {}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            num_units: 8,
            regions: vec![
                RegionConfig::new("main", 0x0000_0000, 1 << 20, RegionKind::Memory),
                RegionConfig::new("control", 0x4000_0000, 0x1000, RegionKind::Registers),
                RegionConfig::new("diag", 0x5000_0000, 0x1000, RegionKind::Registers),
            ],
        }
    }
}

impl FabricConfig {
    /// Crossbar index of the scalar core; the compute units occupy `0..num_units`.
    pub fn cpu_source(&self) -> usize {
        self.num_units
    }

    pub fn num_sources(&self) -> usize {
        self.num_units + 1
    }

    pub fn ensure_valid(&self) -> anyhow::Result<()> {
        ensure!(self.num_units > 0, "num_units must be > 0");
        ensure!(!self.regions.is_empty(), "at least one region is required");
        let memories = self
            .regions
            .iter()
            .filter(|r| r.kind == RegionKind::Memory)
            .count();
        ensure!(memories == 1, "exactly one memory region is required, found {}", memories);

        for region in &self.regions {
            ensure!(region.size > 0, "region '{}' has zero size", region.name);
            ensure!(
                region.base % 4 == 0 && region.size % 4 == 0,
                "region '{}' must be word aligned",
                region.name
            );
            if region.end() > 1u64 << 32 {
                bail!("region '{}' extends past the 32-bit address space", region.name);
            }
        }

        AddressMap::new(&self.regions)?;
        Ok(())
    }

    pub fn memory_region(&self) -> Option<&RegionConfig> {
        self.regions.iter().find(|r| r.kind == RegionKind::Memory)
    }
}
