use std::sync::{Arc, OnceLock};

use anyhow::{ensure, Context};
use smallvec::SmallVec;

use crate::base::behavior::{Clocked, Parameterizable};
use crate::base::mem::HasMemory;
use crate::base::module::{module, IsModule, ModuleBase};
use crate::fabric::types::{Addr, BusResponse, BusTarget, Transaction, Word};
use crate::memctrl::backing::{BackingOp, BackingStore};
use crate::memctrl::cache::{CacheArray, CacheGeometry};
use crate::memctrl::config::CacheConfig;
use crate::memctrl::stats::CacheStats;
use crate::sim::log::Logger;
use crate::timeq::module_now;
use crate::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CtrlPhase {
    #[default]
    Idle,
    Lookup(Transaction),
    MissEvaluate(Transaction),
    /// Dirty victim in `way` is being written to the backing store.
    Writeback { txn: Transaction, way: usize },
    Fetch { txn: Transaction, way: usize },
    Fill { txn: Transaction, way: usize, block: Vec<Word> },
}

impl CtrlPhase {
    fn name(&self) -> &'static str {
        match self {
            CtrlPhase::Idle => "idle",
            CtrlPhase::Lookup(_) => "lookup",
            CtrlPhase::MissEvaluate(_) => "miss_evaluate",
            CtrlPhase::Writeback { .. } => "writeback",
            CtrlPhase::Fetch { .. } => "fetch",
            CtrlPhase::Fill { .. } => "fill",
        }
    }
}

#[derive(Debug, Default)]
pub struct CtrlState {
    phase: CtrlPhase,
    response: Option<BusResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtrlAction {
    Hit {
        set: usize,
        way: usize,
        offset: usize,
        write: Option<Word>,
    },
    Miss,
    IssueBacking(BackingOp),
    RetireWriteback { set: usize, way: usize },
    RetireFetch,
    FillAndServe {
        set: usize,
        way: usize,
        tag: u32,
        block: Vec<Word>,
        offset: usize,
        write: Option<Word>,
    },
}

#[derive(Debug, Clone)]
pub struct CtrlNext {
    pub phase: CtrlPhase,
    pub response: Option<BusResponse>,
    pub actions: SmallVec<[CtrlAction; 2]>,
}

/// Cached controller for the main-memory region.
///
/// Serves one transaction at a time through a set-associative write-back cache. Misses are
/// handled with at most one backing-store access outstanding: a dirty victim is written back and
/// acknowledged before the missing block is fetched, and the request is served against the
/// freshly filled line. Transactions arrive with addresses relative to the region base.
#[derive(Debug)]
pub struct MemoryController {
    base: ModuleBase<CtrlState, CacheConfig>,
    geometry: CacheGeometry,
    cache: CacheArray,
    backing: BackingStore,
    stats: CacheStats,
    logger: Arc<Logger>,
}

module!(MemoryController, CtrlState, CacheConfig,);

impl MemoryController {
    pub fn new(config: Arc<CacheConfig>, memory_bytes: usize, logger: Arc<Logger>) -> anyhow::Result<Self> {
        config.ensure_valid()?;
        ensure!(
            memory_bytes > 0 && memory_bytes % config.block_bytes as usize == 0,
            "memory size {:#x} must be a non-zero multiple of the {}-byte block",
            memory_bytes,
            config.block_bytes
        );
        let mut me = MemoryController {
            base: ModuleBase {
                cycle: 0,
                state: CtrlState::default(),
                config: OnceLock::new(),
            },
            geometry: CacheGeometry::new(&config),
            cache: CacheArray::new(&config),
            backing: BackingStore::new(memory_bytes, config.backing_latency, config.block_bytes),
            stats: CacheStats::default(),
            logger,
        };
        me.init_conf(config);
        Ok(me)
    }

    pub fn phase(&self) -> &CtrlPhase {
        &self.state().phase
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn cache(&self) -> &CacheArray {
        &self.cache
    }

    pub fn backing(&self) -> &BackingStore {
        &self.backing
    }

    /// Read a word as the bus would see it: a resident line wins over the backing store.
    pub fn peek_word(&self, offset: Addr) -> anyhow::Result<Word> {
        if let Some((set, way)) = self.cache.lookup(offset) {
            return Ok(self.cache.line(set, way).data[self.geometry.word_offset(offset)]);
        }
        self.backing.mem().read_word(offset & !0x3)
    }

    /// Write a word into both the backing store and any resident copy, without bus traffic or
    /// dirtying the line. Refused while a transaction is in progress, since a miss may be holding
    /// a copy of the block.
    pub fn poke_word(&mut self, offset: Addr, word: Word) -> anyhow::Result<()> {
        self.ensure_quiet("backdoor write", offset)?;
        self.backing.mem_mut().write_word(offset & !0x3, word)?;
        if let Some((set, way)) = self.cache.lookup(offset) {
            self.cache.patch_word(set, way, self.geometry.word_offset(offset), word);
        }
        Ok(())
    }

    /// Write every dirty line back to the backing store, leaving the lines resident and clean.
    /// Only legal between transactions.
    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.ensure_quiet("flush", 0)?;
        self.write_back_dirty()
    }

    /// Abandon any transaction in progress, write dirty lines back and invalidate the cache.
    pub fn reset(&mut self) -> anyhow::Result<()> {
        self.backing.drain()?;
        self.write_back_dirty()?;
        self.cache.invalidate_all();
        let state = self.state_mut();
        state.phase = CtrlPhase::Idle;
        state.response = None;
        Ok(())
    }

    fn ensure_quiet(&self, what: &str, offset: Addr) -> anyhow::Result<()> {
        let phase = &self.state().phase;
        ensure!(
            *phase == CtrlPhase::Idle && !self.backing.busy(),
            "{} @ {:#010x} while {} is in progress",
            what,
            offset,
            phase.name()
        );
        Ok(())
    }

    fn write_back_dirty(&mut self) -> anyhow::Result<()> {
        for (set, way, block_addr) in self.cache.dirty_lines() {
            let data = self.cache.line(set, way).data.clone();
            self.backing
                .mem_mut()
                .write_words(block_addr, &data)
                .with_context(|| format!("flush of block {:#010x}", block_addr))?;
            self.cache.mark_clean(set, way);
        }
        Ok(())
    }

    fn serve(txn: &Transaction, current: Word) -> BusResponse {
        if txn.is_write() {
            BusResponse::ok(txn.id, 0)
        } else {
            BusResponse::ok(txn.id, current)
        }
    }

    fn fetch_op(&self, txn: &Transaction) -> BackingOp {
        BackingOp::Read {
            block_addr: self.geometry.block_addr(txn.addr),
        }
    }

    fn write_data(txn: &Transaction) -> Option<Word> {
        txn.is_write().then_some(txn.data)
    }
}

impl Clocked for MemoryController {
    type Input = Option<Transaction>;
    type Next = CtrlNext;

    fn evaluate(&self, accept: &Option<Transaction>) -> CtrlNext {
        let now = module_now(self);
        let phase = &self.state().phase;
        let mut next = CtrlNext {
            phase: phase.clone(),
            response: None,
            actions: SmallVec::new(),
        };
        if !matches!(phase, CtrlPhase::Idle) {
            assert!(accept.is_none(), "transaction accepted while {} is in progress", phase.name());
        }

        match phase {
            CtrlPhase::Idle => {
                if let Some(txn) = accept {
                    next.phase = CtrlPhase::Lookup(*txn);
                }
            }
            CtrlPhase::Lookup(txn) => {
                let set = self.geometry.set_index(txn.addr);
                let offset = self.geometry.word_offset(txn.addr);
                match self.cache.find(set, self.geometry.tag(txn.addr)) {
                    Some(way) => {
                        let current = self.cache.line(set, way).data[offset];
                        next.response = Some(Self::serve(txn, current));
                        next.actions.push(CtrlAction::Hit {
                            set,
                            way,
                            offset,
                            write: Self::write_data(txn),
                        });
                        next.phase = CtrlPhase::Idle;
                    }
                    None => {
                        next.actions.push(CtrlAction::Miss);
                        next.phase = CtrlPhase::MissEvaluate(*txn);
                    }
                }
            }
            CtrlPhase::MissEvaluate(txn) => {
                if self.backing.busy() {
                    return next;
                }
                let set = self.geometry.set_index(txn.addr);
                let way = self.cache.victim(set);
                let victim = self.cache.line(set, way);
                if victim.valid && victim.dirty {
                    next.actions.push(CtrlAction::IssueBacking(BackingOp::Write {
                        block_addr: self.geometry.rebuild(victim.tag, set),
                        data: victim.data.clone(),
                    }));
                    next.phase = CtrlPhase::Writeback { txn: *txn, way };
                } else {
                    next.actions.push(CtrlAction::IssueBacking(self.fetch_op(txn)));
                    next.phase = CtrlPhase::Fetch { txn: *txn, way };
                }
            }
            CtrlPhase::Writeback { txn, way } => {
                if self.backing.peek_ack(now).is_some() {
                    let set = self.geometry.set_index(txn.addr);
                    next.actions.push(CtrlAction::RetireWriteback { set, way: *way });
                    next.actions.push(CtrlAction::IssueBacking(self.fetch_op(txn)));
                    next.phase = CtrlPhase::Fetch { txn: *txn, way: *way };
                }
            }
            CtrlPhase::Fetch { txn, way } => {
                if let Some(op) = self.backing.peek_ack(now) {
                    debug_assert_eq!(op, &self.fetch_op(txn));
                    let block = self
                        .backing
                        .read_block(op.block_addr())
                        .expect("fetched block lies inside the memory region");
                    next.actions.push(CtrlAction::RetireFetch);
                    next.phase = CtrlPhase::Fill {
                        txn: *txn,
                        way: *way,
                        block,
                    };
                }
            }
            CtrlPhase::Fill { txn, way, block } => {
                let offset = self.geometry.word_offset(txn.addr);
                next.response = Some(Self::serve(txn, block[offset]));
                next.actions.push(CtrlAction::FillAndServe {
                    set: self.geometry.set_index(txn.addr),
                    way: *way,
                    tag: self.geometry.tag(txn.addr),
                    block: block.clone(),
                    offset,
                    write: Self::write_data(txn),
                });
                next.phase = CtrlPhase::Idle;
            }
        }
        next
    }

    fn commit(&mut self, next: CtrlNext) {
        let now = module_now(self);
        for action in next.actions {
            match action {
                CtrlAction::Hit {
                    set,
                    way,
                    offset,
                    write,
                } => {
                    self.cache.touch(set, way);
                    if let Some(word) = write {
                        self.cache.write_word(set, way, offset, word);
                    }
                    self.stats.record_hit(write.is_some());
                    debug!(self.logger, now, "memctrl: hit set {} way {}", set, way);
                }
                CtrlAction::Miss => self.stats.record_miss(),
                CtrlAction::IssueBacking(op) => {
                    match &op {
                        BackingOp::Read { block_addr } => {
                            self.stats.record_backing_read();
                            debug!(self.logger, now, "memctrl: fetch block {:#010x}", block_addr);
                        }
                        BackingOp::Write { block_addr, .. } => {
                            self.stats.record_backing_write();
                            info!(self.logger, now, "memctrl: write back dirty block {:#010x}", block_addr);
                        }
                    }
                    let issued = self.backing.issue(now, op);
                    assert!(issued.is_ok(), "backing store already has an access in flight");
                }
                CtrlAction::RetireWriteback { set, way } => {
                    self.backing
                        .retire(now)
                        .expect("write-back lies inside the memory region");
                    self.cache.mark_clean(set, way);
                }
                CtrlAction::RetireFetch => {
                    self.backing
                        .retire(now)
                        .expect("fetch lies inside the memory region");
                }
                CtrlAction::FillAndServe {
                    set,
                    way,
                    tag,
                    block,
                    offset,
                    write,
                } => {
                    self.cache.fill(set, way, tag, block);
                    if let Some(word) = write {
                        self.cache.write_word(set, way, offset, word);
                    }
                    self.stats.record_fill();
                    info!(
                        self.logger,
                        now,
                        "memctrl: filled block {:#010x} into set {} way {}",
                        self.geometry.rebuild(tag, set),
                        set,
                        way
                    );
                }
            }
        }
        let state = self.state_mut();
        state.phase = next.phase;
        state.response = next.response;
        self.base.cycle += 1;
    }
}

impl BusTarget for MemoryController {
    fn name(&self) -> &str {
        "memory"
    }

    fn ready(&self) -> bool {
        let state = self.state();
        state.phase == CtrlPhase::Idle && state.response.is_none()
    }

    fn response(&self) -> Option<BusResponse> {
        self.state().response
    }

    fn clock(&mut self, accept: Option<Transaction>) {
        let next = self.evaluate(&accept);
        self.commit(next);
    }
}
