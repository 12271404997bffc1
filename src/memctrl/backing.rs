use anyhow::Context;

use crate::base::mem::HasMemory;
use crate::fabric::types::{Addr, Word};
use crate::sim::flat_mem::FlatMemory;
use crate::timeq::{Backpressure, Cycle, ServerConfig, ServiceRequest, Ticket, TimedServer};

/// One block-granular access to the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackingOp {
    Read { block_addr: Addr },
    Write { block_addr: Addr, data: Vec<Word> },
}

impl BackingOp {
    pub fn block_addr(&self) -> Addr {
        match self {
            BackingOp::Read { block_addr } | BackingOp::Write { block_addr, .. } => *block_addr,
        }
    }
}

/// Fixed-latency, always-available memory behind the cache. Accepts one access at a time and
/// acknowledges it `latency` cycles after issue.
#[derive(Debug)]
pub struct BackingStore {
    mem: FlatMemory,
    server: TimedServer<BackingOp>,
    block_bytes: u32,
}

impl BackingStore {
    pub fn new(size_bytes: usize, latency: Cycle, block_bytes: u32) -> Self {
        assert!(latency >= 1, "backing store latency must be at least one cycle");
        Self {
            mem: FlatMemory::new_with_size(size_bytes),
            // one block per cycle of transfer on top of the base latency
            server: TimedServer::new(ServerConfig {
                base_latency: latency - 1,
                bytes_per_cycle: block_bytes,
                queue_capacity: 1,
            }),
            block_bytes,
        }
    }

    pub fn busy(&self) -> bool {
        self.server.outstanding() > 0
    }

    pub fn issue(&mut self, now: Cycle, op: BackingOp) -> Result<Ticket, Backpressure<BackingOp>> {
        debug_assert_eq!(op.block_addr() % self.block_bytes, 0, "unaligned block access");
        self.server
            .try_enqueue(now, ServiceRequest::new(op, self.block_bytes))
    }

    /// The in-flight access, if it is acknowledged at `now`.
    pub fn peek_ack(&self, now: Cycle) -> Option<&BackingOp> {
        self.server.peek_ready(now).map(|(op, _)| op)
    }

    /// Retire the acknowledged access; a write lands in memory here.
    pub fn retire(&mut self, now: Cycle) -> anyhow::Result<Option<BackingOp>> {
        let Some(done) = self.server.pop_ready(now) else {
            return Ok(None);
        };
        if let BackingOp::Write { block_addr, data } = &done.payload {
            self.mem
                .write_words(*block_addr, data)
                .with_context(|| format!("write-back of block {:#010x}", block_addr))?;
        }
        Ok(Some(done.payload))
    }

    pub fn read_block(&self, block_addr: Addr) -> anyhow::Result<Vec<Word>> {
        self.mem
            .read_words(block_addr, (self.block_bytes / 4) as usize)
            .with_context(|| format!("fetch of block {:#010x}", block_addr))
    }

    /// Land any in-flight write immediately, discarding its timing.
    pub fn drain(&mut self) -> anyhow::Result<()> {
        while let Some(ticket) = self.server.oldest_ticket().copied() {
            self.retire(ticket.ready_at())?;
        }
        // forget the drained access's occupancy so the next issue is not refused
        self.server.clear();
        Ok(())
    }

    pub fn mem(&self) -> &FlatMemory {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut FlatMemory {
        &mut self.mem
    }

    pub fn size(&self) -> usize {
        self.mem.size()
    }
}
