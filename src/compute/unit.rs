use std::sync::Arc;

use serde::Serialize;

use crate::base::behavior::Clocked;
use crate::fabric::types::{Addr, BusResponse, SourceId, Transaction, Word, WORD_BYTES};
use crate::sim::log::Logger;
use crate::timeq::Cycle;
use crate::{debug, info};

/// Tile edge; every activation multiplies two `DIM`×`DIM` tiles.
pub const DIM: usize = 4;
pub const INPUT_BITS: u32 = i8::BITS;
pub const ACC_BITS: u32 = i32::BITS;
/// Input elements per memory word.
pub const INPUTS_PER_WORD: usize = (Word::BITS / INPUT_BITS) as usize;
/// Word reads per operand tile.
pub const LOAD_WORDS: usize = DIM * DIM / INPUTS_PER_WORD;
/// Word writes for the result tile; one accumulator element per word.
pub const STORE_WORDS: usize = DIM * DIM * ACC_BITS as usize / Word::BITS as usize;
pub const COMPUTE_STEPS: usize = DIM;

// a product of two inputs needs 2 * INPUT_BITS bits, and DIM of them summed need log2(DIM) more
const _: () = assert!(2 * INPUT_BITS + DIM.ilog2() < ACC_BITS, "accumulator would overflow");
const _: () = assert!(INPUTS_PER_WORD == DIM, "each loaded word holds one tile row");

/// Cycles from the activation cycle until `done` is asserted when every bus access takes
/// `access_cycles` cycles from first presentation to the acknowledging cycle inclusive.
pub const fn activation_cycles(access_cycles: u64) -> u64 {
    1 + (2 * LOAD_WORDS as u64) * access_cycles + COMPUTE_STEPS as u64 + STORE_WORDS as u64 * access_cycles
}

/// Operand addresses captured at activation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Operands {
    pub a: Addr,
    pub b: Addr,
    pub c: Addr,
}

impl Operands {
    /// Whether every tile lies below the top of the 32-bit address space, so per-word
    /// addresses never wrap.
    pub fn in_range(&self) -> bool {
        let fits = |base: Addr, words: usize| {
            base as u64 + words as u64 * WORD_BYTES as u64 <= 1u64 << Addr::BITS
        };
        fits(self.a, LOAD_WORDS) && fits(self.b, LOAD_WORDS) && fits(self.c, STORE_WORDS)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    LoadA,
    LoadB,
    Compute,
    StoreC,
    Done,
}

/// Status flags readable through the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Idle = 0,
    Busy = 1,
    Done = 2,
    Error = 3,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputeUnitState {
    phase: Phase,
    operands: Operands,
    a: [[i8; DIM]; DIM],
    b: [[i8; DIM]; DIM],
    acc: [[i32; DIM]; DIM],
    /// Words transferred in the current load/store phase.
    word: usize,
    /// Output rows computed so far.
    row: usize,
    next_id: u64,
    error: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnitInput {
    pub start: Option<Operands>,
    pub response: Option<BusResponse>,
}

/// One matrix unit: loads two 4×4 i8 tiles, multiplies them into an i32 accumulator one row
/// per cycle, stores the result, then pulses `done` for one cycle.
#[derive(Debug)]
pub struct ComputeUnit {
    id: usize,
    source: SourceId,
    state: ComputeUnitState,
    cycle: Cycle,
    logger: Arc<Logger>,
}

pub fn pack_row(row: &[i8; DIM]) -> Word {
    Word::from_le_bytes(row.map(|v| v as u8))
}

pub fn unpack_row(word: Word) -> [i8; DIM] {
    word.to_le_bytes().map(|b| b as i8)
}

impl ComputeUnit {
    pub fn new(id: usize, source: SourceId, logger: Arc<Logger>) -> Self {
        Self {
            id,
            source,
            state: ComputeUnitState::default(),
            cycle: 0,
            logger,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn busy(&self) -> bool {
        self.state.phase != Phase::Idle
    }

    pub fn done(&self) -> bool {
        self.state.phase == Phase::Done
    }

    /// Error flag of the current or most recent activation.
    pub fn error(&self) -> bool {
        self.state.error
    }

    pub fn status(&self) -> UnitStatus {
        match (self.state.phase, self.state.error) {
            (Phase::Idle, false) => UnitStatus::Idle,
            (Phase::Done, false) => UnitStatus::Done,
            (Phase::Idle | Phase::Done, true) => UnitStatus::Error,
            _ => UnitStatus::Busy,
        }
    }

    pub fn accumulator(&self) -> &[[i32; DIM]; DIM] {
        &self.state.acc
    }

    /// The presented bus request, derived from committed state only.
    pub fn request(&self) -> Option<Transaction> {
        let s = &self.state;
        let word_addr = |base: Addr| base + (s.word as Addr) * WORD_BYTES;
        match s.phase {
            Phase::LoadA => Some(Transaction::read(self.source, s.next_id, word_addr(s.operands.a))),
            Phase::LoadB => Some(Transaction::read(self.source, s.next_id, word_addr(s.operands.b))),
            Phase::StoreC => {
                let value = s.acc[s.word / DIM][s.word % DIM];
                Some(Transaction::write(self.source, s.next_id, word_addr(s.operands.c), value as Word))
            }
            Phase::Idle | Phase::Compute | Phase::Done => None,
        }
    }

    pub fn reset(&mut self) {
        self.state = ComputeUnitState::default();
    }
}

impl Clocked for ComputeUnit {
    type Input = UnitInput;
    type Next = ComputeUnitState;

    fn evaluate(&self, input: &UnitInput) -> ComputeUnitState {
        let mut next = self.state.clone();
        if let Some(response) = input.response {
            debug_assert!(self.request().is_some(), "unit {} acknowledged without a request", self.id);
            debug_assert_eq!(next.next_id, response.id);
            next.next_id += 1;
            if response.error {
                next.error = true;
                next.phase = Phase::Done;
                return next;
            }
        }

        match self.state.phase {
            Phase::Idle => {
                if let Some(operands) = input.start {
                    next.operands = operands;
                    next.acc = [[0; DIM]; DIM];
                    next.word = 0;
                    next.row = 0;
                    next.error = !operands.in_range();
                    next.phase = if next.error { Phase::Done } else { Phase::LoadA };
                }
            }
            Phase::LoadA | Phase::LoadB => {
                if let Some(response) = input.response {
                    let row = unpack_row(response.data);
                    if next.phase == Phase::LoadA {
                        next.a[next.word] = row;
                    } else {
                        next.b[next.word] = row;
                    }
                    next.word += 1;
                    if next.word == LOAD_WORDS {
                        next.word = 0;
                        next.phase = match next.phase {
                            Phase::LoadA => Phase::LoadB,
                            _ => Phase::Compute,
                        };
                    }
                }
            }
            Phase::Compute => {
                let i = next.row;
                for j in 0..DIM {
                    let dot: i32 = (0..DIM)
                        .map(|k| next.a[i][k] as i32 * next.b[k][j] as i32)
                        .sum();
                    next.acc[i][j] += dot;
                }
                next.row += 1;
                if next.row == COMPUTE_STEPS {
                    next.word = 0;
                    next.phase = Phase::StoreC;
                }
            }
            Phase::StoreC => {
                if input.response.is_some() {
                    next.word += 1;
                    if next.word == STORE_WORDS {
                        next.phase = Phase::Done;
                    }
                }
            }
            Phase::Done => next.phase = Phase::Idle,
        }
        next
    }

    fn commit(&mut self, next: ComputeUnitState) {
        if next.phase != self.state.phase {
            match next.phase {
                Phase::LoadA => {
                    info!(
                        self.logger,
                        self.cycle,
                        "unit {}: start a={:#x} b={:#x} c={:#x}",
                        self.id,
                        next.operands.a,
                        next.operands.b,
                        next.operands.c
                    );
                }
                Phase::Done if next.error && self.state.phase == Phase::Idle => {
                    info!(self.logger, self.cycle, "unit {}: operands wrap the address space", self.id);
                }
                Phase::Done if next.error => {
                    info!(self.logger, self.cycle, "unit {}: aborted on bus error", self.id);
                }
                Phase::Done => {
                    info!(self.logger, self.cycle, "unit {}: done", self.id);
                }
                phase => {
                    debug!(self.logger, self.cycle, "unit {}: -> {:?}", self.id, phase);
                }
            }
        }
        self.state = next;
        self.cycle += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Responds to a newly presented request on the following cycle.
    struct IdealMemory {
        words: HashMap<Addr, Word>,
        response: Option<BusResponse>,
    }

    impl IdealMemory {
        fn new() -> Self {
            Self {
                words: HashMap::new(),
                response: None,
            }
        }

        fn load_tile(&mut self, base: Addr, tile: &[[i8; DIM]; DIM]) {
            for (r, row) in tile.iter().enumerate() {
                self.words.insert(base + 4 * r as Addr, pack_row(row));
            }
        }

        /// Latch a request for next cycle unless a response goes out this cycle.
        fn accept(&mut self, request: Option<Transaction>) {
            self.response = request.map(|txn| {
                if txn.is_write() {
                    self.words.insert(txn.addr, txn.data);
                    BusResponse::ok(txn.id, 0)
                } else {
                    BusResponse::ok(txn.id, self.words.get(&txn.addr).copied().unwrap_or(0))
                }
            });
        }
    }

    fn unit() -> ComputeUnit {
        ComputeUnit::new(0, 0, Arc::new(Logger::silent()))
    }

    fn operands() -> Operands {
        Operands {
            a: 0x1000,
            b: 0x1100,
            c: 0x1200,
        }
    }

    fn sequential() -> [[i8; DIM]; DIM] {
        let mut tile = [[0; DIM]; DIM];
        for (i, v) in (1..=16).enumerate() {
            tile[i / DIM][i % DIM] = v;
        }
        tile
    }

    fn identity() -> [[i8; DIM]; DIM] {
        let mut tile = [[0; DIM]; DIM];
        (0..DIM).for_each(|i| tile[i][i] = 1);
        tile
    }

    /// Clock the unit against `mem` until `done`; returns the number of cycles taken.
    fn run(unit: &mut ComputeUnit, mem: &mut IdealMemory) -> u64 {
        let mut start = Some(operands());
        for cycle in 1..1000 {
            let request = unit.request();
            let response = mem.response.take();
            let next = unit.evaluate(&UnitInput { start: start.take(), response });
            if response.is_none() {
                mem.accept(request);
            }
            unit.commit(next);
            if unit.done() {
                return cycle;
            }
        }
        panic!("unit never finished");
    }

    #[test]
    fn identity_product_reproduces_a_in_fixed_cycles() {
        let mut mem = IdealMemory::new();
        mem.load_tile(operands().a, &sequential());
        mem.load_tile(operands().b, &identity());
        let mut unit = unit();
        let cycles = run(&mut unit, &mut mem);
        assert_eq!(activation_cycles(2), cycles);
        assert_eq!(UnitStatus::Done, unit.status());

        for i in 0..DIM * DIM {
            let stored = mem.words[&(operands().c + 4 * i as Addr)] as i32;
            assert_eq!((i + 1) as i32, stored);
        }

        // done lasts one cycle
        let next = unit.evaluate(&UnitInput::default());
        unit.commit(next);
        assert_eq!(Phase::Idle, unit.phase());
        assert!(!unit.busy());
    }

    #[test]
    fn extreme_inputs_do_not_overflow() {
        let mut mem = IdealMemory::new();
        mem.load_tile(operands().a, &[[i8::MIN; DIM]; DIM]);
        mem.load_tile(operands().b, &[[i8::MIN; DIM]; DIM]);
        let mut unit = unit();
        run(&mut unit, &mut mem);
        let expected = DIM as i32 * (i8::MIN as i32 * i8::MIN as i32);
        assert!(unit.accumulator().iter().flatten().all(|&v| v == expected));
        assert_eq!(expected as Word, mem.words[&operands().c]);
    }

    #[test]
    fn no_traffic_while_computing() {
        let mut unit = unit();
        unit.state.phase = Phase::Compute;
        assert!(unit.request().is_none());
        for _ in 0..COMPUTE_STEPS {
            assert!(unit.busy());
            let next = unit.evaluate(&UnitInput::default());
            unit.commit(next);
        }
        assert_eq!(Phase::StoreC, unit.phase());
        assert!(unit.request().unwrap().is_write());
    }

    #[test]
    fn error_response_aborts_with_done_pulse() {
        let mut unit = unit();
        let next = unit.evaluate(&UnitInput {
            start: Some(operands()),
            response: None,
        });
        unit.commit(next);
        let id = unit.request().unwrap().id;
        let next = unit.evaluate(&UnitInput {
            start: None,
            response: Some(BusResponse::poison(id)),
        });
        unit.commit(next);
        assert!(unit.done());
        assert_eq!(UnitStatus::Error, unit.status());
        let next = unit.evaluate(&UnitInput::default());
        unit.commit(next);
        assert_eq!(UnitStatus::Error, unit.status());
        assert!(!unit.busy());
    }

    #[test]
    fn operands_at_the_top_of_memory_abort_without_traffic() {
        let edge = Operands {
            a: 0xFFFF_FFF0,
            b: 0x1000,
            c: 0xFFFF_FFC0,
        };
        assert!(edge.in_range());
        let wrapping = Operands { a: 0xFFFF_FFFC, ..edge };
        assert!(!wrapping.in_range());
        assert!(!Operands { c: 0xFFFF_FFD0, ..edge }.in_range());

        let mut unit = unit();
        let next = unit.evaluate(&UnitInput {
            start: Some(wrapping),
            response: None,
        });
        unit.commit(next);
        assert!(unit.done());
        assert_eq!(UnitStatus::Error, unit.status());
        assert!(unit.request().is_none());
        let next = unit.evaluate(&UnitInput::default());
        unit.commit(next);
        assert_eq!(UnitStatus::Error, unit.status());
    }

    #[test]
    fn start_is_ignored_while_busy() {
        let mut unit = unit();
        let next = unit.evaluate(&UnitInput {
            start: Some(operands()),
            response: None,
        });
        unit.commit(next);
        let before = unit.request();
        let other = Operands { a: 0, b: 0, c: 0 };
        let next = unit.evaluate(&UnitInput {
            start: Some(other),
            response: None,
        });
        unit.commit(next);
        assert_eq!(before, unit.request());
    }

    #[test]
    fn rows_pack_little_endian() {
        let row = [1, -1, 2, -128];
        assert_eq!(0x80_02_FF_01, pack_row(&row));
        assert_eq!(row, unpack_row(pack_row(&row)));
    }
}
