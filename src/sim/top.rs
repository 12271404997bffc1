use std::sync::Arc;

use anyhow::{bail, Context};
use log::warn;
use smallvec::SmallVec;

use crate::base::behavior::{Clocked, ModuleBehaviors};
use crate::compute::ComputeArray;
use crate::fabric::config::{FabricConfig, RegionKind};
use crate::fabric::crossbar::{AddressMap, Crossbar, CrossbarInput};
use crate::fabric::regfile::RegisterFile;
use crate::fabric::scalar::ScalarPort;
use crate::fabric::types::{Addr, BusResponse, BusTarget, Grant, Transaction, Word};
use crate::memctrl::{CacheConfig, MemoryController};
use crate::sim::config::SimConfig;
use crate::sim::log::Logger;
use crate::sim::stats::{DestSummary, FabricStats, UnitSummary};
use crate::sim::trace::GrantTrace;
use crate::timeq::Cycle;
use crate::info;

/// A crossbar destination.
#[derive(Debug)]
pub enum Target {
    Memory(MemoryController),
    Registers(RegisterFile),
}

impl BusTarget for Target {
    fn name(&self) -> &str {
        match self {
            Target::Memory(m) => m.name(),
            Target::Registers(r) => r.name(),
        }
    }

    fn ready(&self) -> bool {
        match self {
            Target::Memory(m) => m.ready(),
            Target::Registers(r) => r.ready(),
        }
    }

    fn response(&self) -> Option<BusResponse> {
        match self {
            Target::Memory(m) => m.response(),
            Target::Registers(r) => r.response(),
        }
    }

    fn clock(&mut self, accept: Option<Transaction>) {
        match self {
            Target::Memory(m) => m.clock(accept),
            Target::Registers(r) => r.clock(accept),
        }
    }
}

/// Arbitration inputs and outcome of the most recent cycle.
#[derive(Debug, Clone, Default)]
pub struct RouteSnapshot {
    pub cycle: Cycle,
    /// pending[dest][source]
    pub pending: Vec<Vec<bool>>,
    pub dest_ready: Vec<bool>,
    pub grants: SmallVec<[Grant; 4]>,
}

/// Compute array, scalar core port, crossbar and destinations, stepped by one clock.
///
/// Every cycle first evaluates all components against committed state, then commits them.
pub struct Fabric {
    cycle: Cycle,
    config: Arc<FabricConfig>,
    array: ComputeArray,
    cpu: ScalarPort,
    crossbar: Crossbar,
    targets: Vec<Target>,
    memory: usize,
    last_route: RouteSnapshot,
    trace: Option<GrantTrace>,
    logger: Arc<Logger>,
}

impl Fabric {
    pub fn new(fabric: Arc<FabricConfig>, cache: Arc<CacheConfig>, sim: &SimConfig) -> anyhow::Result<Self> {
        fabric.ensure_valid()?;
        let logger = Arc::new(Logger::new(sim.log_level));
        let map = AddressMap::new(&fabric.regions)?;

        let mut targets = Vec::with_capacity(map.len());
        for region in map.regions() {
            let target = match region.kind {
                RegionKind::Memory => Target::Memory(
                    MemoryController::new(cache.clone(), region.size as usize, logger.clone())
                        .with_context(|| format!("memory region '{}'", region.name))?,
                ),
                RegionKind::Registers => Target::Registers(RegisterFile::new(Arc::new(region.clone()))),
            };
            targets.push(target);
        }
        let memory = targets
            .iter()
            .position(|t| matches!(t, Target::Memory(_)))
            .context("no memory region")?;

        let trace = match &sim.trace {
            Some(path) => match GrantTrace::create(path) {
                Ok(trace) => Some(trace),
                Err(err) => {
                    warn!("cannot open grant trace {}: {}", path.display(), err);
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            cycle: 0,
            array: ComputeArray::new(fabric.num_units, logger.clone()),
            cpu: ScalarPort::new(fabric.cpu_source()),
            crossbar: Crossbar::new(map, fabric.num_sources(), fabric.cpu_source()),
            targets,
            memory,
            last_route: RouteSnapshot::default(),
            trace,
            logger,
            config: fabric,
        })
    }

    pub fn cycle(&self) -> Cycle {
        self.cycle
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    pub fn array(&self) -> &ComputeArray {
        &self.array
    }

    pub fn array_mut(&mut self) -> &mut ComputeArray {
        &mut self.array
    }

    pub fn cpu(&self) -> &ScalarPort {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut ScalarPort {
        &mut self.cpu
    }

    pub fn crossbar(&self) -> &Crossbar {
        &self.crossbar
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn memory(&self) -> &MemoryController {
        match &self.targets[self.memory] {
            Target::Memory(m) => m,
            Target::Registers(_) => unreachable!("memory index points at a register target"),
        }
    }

    fn memory_mut(&mut self) -> &mut MemoryController {
        match &mut self.targets[self.memory] {
            Target::Memory(m) => m,
            Target::Registers(_) => unreachable!("memory index points at a register target"),
        }
    }

    pub fn last_route(&self) -> &RouteSnapshot {
        &self.last_route
    }

    /// Nothing running, nothing queued and nothing in flight.
    pub fn quiescent(&self) -> bool {
        self.array.all_idle()
            && self.cpu.idle()
            && (0..self.crossbar.map().len()).all(|d| self.crossbar.owner(d).is_none())
            && (0..self.config.num_sources()).all(|s| !self.crossbar.is_engaged(s))
    }

    /// Coherent backdoor read of an absolute address.
    pub fn peek_word(&self, addr: Addr) -> anyhow::Result<Word> {
        let Some((dest, offset)) = self.crossbar.map().decode(addr) else {
            bail!("peek of unmapped address {:#010x}", addr);
        };
        match &self.targets[dest] {
            Target::Memory(m) => m.peek_word(offset),
            Target::Registers(r) => Ok(r.peek(offset)),
        }
    }

    /// Coherent backdoor write of an absolute address; generates no bus traffic.
    pub fn poke_word(&mut self, addr: Addr, word: Word) -> anyhow::Result<()> {
        let Some((dest, offset)) = self.crossbar.map().decode(addr) else {
            bail!("poke of unmapped address {:#010x}", addr);
        };
        match &mut self.targets[dest] {
            Target::Memory(m) => m.poke_word(offset, word),
            Target::Registers(r) => {
                r.poke(offset, word);
                Ok(())
            }
        }
    }

    pub fn poke_words(&mut self, addr: Addr, words: &[Word]) -> anyhow::Result<()> {
        for (i, &word) in words.iter().enumerate() {
            self.poke_word(addr + 4 * i as Addr, word)?;
        }
        Ok(())
    }

    pub fn peek_words(&self, addr: Addr, count: usize) -> anyhow::Result<Vec<Word>> {
        (0..count).map(|i| self.peek_word(addr + 4 * i as Addr)).collect()
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.memory_mut().flush()
    }

    /// Return every component to its power-on state. Dirty lines are written back first.
    pub fn reset(&mut self) -> anyhow::Result<()> {
        for target in self.targets.iter_mut() {
            match target {
                Target::Memory(m) => m.reset()?,
                Target::Registers(r) => r.reset(),
            }
        }
        self.array.reset();
        self.cpu.reset();
        self.crossbar.reset();
        self.last_route = RouteSnapshot::default();
        Ok(())
    }

    /// Tick until `done` holds, giving up after `limit` cycles.
    pub fn run_until<F>(&mut self, limit: Cycle, mut done: F) -> anyhow::Result<Cycle>
    where
        F: FnMut(&Fabric) -> bool,
    {
        let start = self.cycle;
        while !done(self) {
            if self.cycle - start >= limit {
                bail!("timed out after {} cycles", limit);
            }
            self.tick_one();
        }
        Ok(self.cycle - start)
    }

    pub fn stats(&self) -> FabricStats {
        let xstats = self.crossbar.stats();
        let num_sources = self.config.num_sources();
        let cpu = self.config.cpu_source();
        let units = self
            .array
            .units()
            .iter()
            .map(|u| UnitSummary {
                unit: u.id(),
                activations: self.array.activations(u.id()),
                completions: self.array.completions(u.id()),
                status: u.status(),
                grants: xstats.grants_to(u.id()),
            })
            .collect();
        let destinations = (0..self.targets.len())
            .map(|dest| DestSummary {
                name: self.crossbar.map().region(dest).name.clone(),
                grants: (0..num_sources).map(|s| xstats.grants(dest, s)).collect(),
            })
            .collect();
        let cache = *self.memory().stats();
        FabricStats {
            cycles: self.cycle,
            units,
            cpu_grants: xstats.grants_to(cpu),
            cpu_completions: self.cpu.completed().len(),
            destinations,
            decode_faults: (0..num_sources).map(|s| xstats.decode_faults(s)).collect(),
            hit_rate: cache.hit_rate(),
            cache,
        }
    }
}

impl ModuleBehaviors for Fabric {
    fn tick_one(&mut self) {
        // evaluate
        let mut requests: Vec<Option<Transaction>> = self.array.requests().collect();
        requests.push(self.cpu.request());
        let input = CrossbarInput {
            requests,
            dest_ready: self.targets.iter().map(BusTarget::ready).collect(),
            dest_responses: self.targets.iter().map(BusTarget::response).collect(),
        };
        let xnext = self.crossbar.evaluate(&input);
        let cpu = self.config.cpu_source();
        let array_next = self.array.evaluate(&xnext.responses[..cpu].to_vec());
        let cpu_next = self.cpu.evaluate(&xnext.responses[cpu]);

        for &source in &xnext.faults {
            info!(
                self.logger,
                self.cycle,
                "decode fault: source {} addr {:#010x}",
                source,
                input.requests[source].map(|r| r.addr).unwrap_or_default()
            );
        }
        if let Some(trace) = self.trace.as_mut() {
            for grant in &xnext.grants {
                trace.write_grant(self.cycle, &self.crossbar.map().region(grant.dest).name, grant);
            }
        }
        self.last_route = RouteSnapshot {
            cycle: self.cycle,
            pending: xnext.pending.clone(),
            dest_ready: input.dest_ready,
            grants: xnext.grants.clone(),
        };

        // commit
        for (target, forward) in self.targets.iter_mut().zip(xnext.forward.iter()) {
            target.clock(*forward);
        }
        self.crossbar.commit(xnext);
        self.array.commit(array_next);
        self.cpu.commit(cpu_next);
        self.cycle += 1;
    }
}
