use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    accesses: u64,
    hits: u64,
    misses: u64,
    read_hits: u64,
    write_hits: u64,
    fills: u64,
    writebacks: u64,
    backing_reads: u64,
    backing_writes: u64,
}

impl CacheStats {
    pub fn accesses(&self) -> u64 {
        self.accesses
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn read_hits(&self) -> u64 {
        self.read_hits
    }

    pub fn write_hits(&self) -> u64 {
        self.write_hits
    }

    pub fn fills(&self) -> u64 {
        self.fills
    }

    pub fn writebacks(&self) -> u64 {
        self.writebacks
    }

    pub fn backing_reads(&self) -> u64 {
        self.backing_reads
    }

    pub fn backing_writes(&self) -> u64 {
        self.backing_writes
    }

    pub fn hit_rate(&self) -> f64 {
        if self.accesses == 0 {
            return 0.0;
        }
        self.hits as f64 / self.accesses as f64
    }

    pub fn record_hit(&mut self, write: bool) {
        self.accesses = self.accesses.saturating_add(1);
        self.hits = self.hits.saturating_add(1);
        if write {
            self.write_hits = self.write_hits.saturating_add(1);
        } else {
            self.read_hits = self.read_hits.saturating_add(1);
        }
    }

    pub fn record_miss(&mut self) {
        self.accesses = self.accesses.saturating_add(1);
        self.misses = self.misses.saturating_add(1);
    }

    pub fn record_fill(&mut self) {
        self.fills = self.fills.saturating_add(1);
    }

    pub fn record_backing_read(&mut self) {
        self.backing_reads = self.backing_reads.saturating_add(1);
    }

    pub fn record_backing_write(&mut self) {
        self.backing_writes = self.backing_writes.saturating_add(1);
        self.writebacks = self.writebacks.saturating_add(1);
    }
}
