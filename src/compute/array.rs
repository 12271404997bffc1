use std::sync::Arc;

use anyhow::ensure;

use crate::base::behavior::Clocked;
use crate::compute::unit::{ComputeUnit, ComputeUnitState, Operands, UnitInput, UnitStatus};
use crate::fabric::types::{BusResponse, Transaction};
use crate::sim::log::Logger;

/// Compute units `0..n`, occupying crossbar sources `0..n`.
#[derive(Debug)]
pub struct ComputeArray {
    units: Vec<ComputeUnit>,
    /// Start latched by `launch`; held until the activation's done pulse.
    start_pending: Vec<Option<Operands>>,
    activations: Vec<u64>,
    completions: Vec<u64>,
}

#[derive(Debug)]
pub struct ArrayNext {
    units: Vec<ComputeUnitState>,
    started: Vec<bool>,
}

impl ComputeArray {
    pub fn new(num_units: usize, logger: Arc<Logger>) -> Self {
        Self {
            units: (0..num_units)
                .map(|id| ComputeUnit::new(id, id, logger.clone()))
                .collect(),
            start_pending: vec![None; num_units],
            activations: vec![0; num_units],
            completions: vec![0; num_units],
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn unit(&self, id: usize) -> &ComputeUnit {
        &self.units[id]
    }

    pub fn units(&self) -> &[ComputeUnit] {
        &self.units
    }

    /// Whether `unit` can take a new activation: not running and no start latched.
    pub fn available(&self, unit: usize) -> bool {
        !self.units[unit].busy() && self.start_pending[unit].is_none()
    }

    /// Latch a start for `unit`; it begins at the next clock edge.
    pub fn launch(&mut self, unit: usize, operands: Operands) -> anyhow::Result<()> {
        ensure!(unit < self.units.len(), "no compute unit {}", unit);
        ensure!(self.available(unit), "compute unit {} is busy", unit);
        ensure!(
            operands.in_range(),
            "operands a={:#x} b={:#x} c={:#x} run past the end of the address space",
            operands.a,
            operands.b,
            operands.c
        );
        self.start_pending[unit] = Some(operands);
        Ok(())
    }

    pub fn requests(&self) -> impl Iterator<Item = Option<Transaction>> + '_ {
        self.units.iter().map(ComputeUnit::request)
    }

    pub fn busy(&self) -> Vec<bool> {
        self.units.iter().map(ComputeUnit::busy).collect()
    }

    pub fn done(&self) -> Vec<bool> {
        self.units.iter().map(ComputeUnit::done).collect()
    }

    pub fn status(&self) -> Vec<UnitStatus> {
        self.units.iter().map(ComputeUnit::status).collect()
    }

    /// Units whose `done` is asserted this cycle.
    pub fn done_units(&self) -> impl Iterator<Item = usize> + '_ {
        self.units.iter().filter(|u| u.done()).map(ComputeUnit::id)
    }

    pub fn all_idle(&self) -> bool {
        self.units.iter().all(|u| !u.busy()) && self.start_pending.iter().all(Option::is_none)
    }

    pub fn activations(&self, unit: usize) -> u64 {
        self.activations[unit]
    }

    pub fn completions(&self, unit: usize) -> u64 {
        self.completions[unit]
    }

    pub fn reset(&mut self) {
        self.units.iter_mut().for_each(ComputeUnit::reset);
        self.start_pending.iter_mut().for_each(|s| *s = None);
    }
}

impl Clocked for ComputeArray {
    /// Response delivered to each unit this cycle.
    type Input = Vec<Option<BusResponse>>;
    type Next = ArrayNext;

    fn evaluate(&self, responses: &Vec<Option<BusResponse>>) -> ArrayNext {
        debug_assert_eq!(responses.len(), self.units.len());
        let mut started = vec![false; self.units.len()];
        let units = self
            .units
            .iter()
            .zip(responses)
            .enumerate()
            .map(|(id, (unit, response))| {
                let start = if unit.busy() { None } else { self.start_pending[id] };
                started[id] = start.is_some();
                unit.evaluate(&UnitInput {
                    start,
                    response: *response,
                })
            })
            .collect();
        ArrayNext { units, started }
    }

    fn commit(&mut self, next: ArrayNext) {
        for (id, (unit, state)) in self.units.iter_mut().zip(next.units).enumerate() {
            if next.started[id] {
                self.activations[id] += 1;
            }
            unit.commit(state);
            if unit.done() {
                self.start_pending[id] = None;
                self.completions[id] += 1;
            }
        }
    }
}
