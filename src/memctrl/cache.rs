use crate::fabric::types::{Addr, Word, WORD_BYTES};
use crate::memctrl::config::CacheConfig;

/// Splits byte addresses into tag, set index and word offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheGeometry {
    offset_bits: u32,
    set_bits: u32,
}

impl CacheGeometry {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            offset_bits: config.block_bytes.trailing_zeros(),
            set_bits: config.sets.trailing_zeros(),
        }
    }

    pub fn set_index(&self, addr: Addr) -> usize {
        ((addr >> self.offset_bits) & ((1 << self.set_bits) - 1)) as usize
    }

    pub fn tag(&self, addr: Addr) -> u32 {
        addr.checked_shr(self.offset_bits + self.set_bits).unwrap_or(0)
    }

    pub fn word_offset(&self, addr: Addr) -> usize {
        ((addr & ((1 << self.offset_bits) - 1)) / WORD_BYTES) as usize
    }

    pub fn block_addr(&self, addr: Addr) -> Addr {
        addr & !((1 << self.offset_bits) - 1)
    }

    /// Block address of the line holding `tag` in `set`.
    pub fn rebuild(&self, tag: u32, set: usize) -> Addr {
        let tag_part = tag.checked_shl(self.offset_bits + self.set_bits).unwrap_or(0);
        tag_part | ((set as Addr) << self.offset_bits)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLine {
    pub tag: u32,
    pub valid: bool,
    pub dirty: bool,
    pub data: Vec<Word>,
}

impl CacheLine {
    fn empty(words: usize) -> Self {
        Self {
            tag: 0,
            valid: false,
            dirty: false,
            data: vec![0; words],
        }
    }
}

/// Set-associative data array with per-set LRU ordering (front = most recent).
#[derive(Debug)]
pub struct CacheArray {
    geometry: CacheGeometry,
    sets: usize,
    ways: usize,
    lines: Vec<Vec<CacheLine>>,
    lru: Vec<Vec<usize>>,
}

impl CacheArray {
    pub fn new(config: &CacheConfig) -> Self {
        let words = config.words_per_block();
        Self {
            geometry: CacheGeometry::new(config),
            sets: config.sets,
            ways: config.ways,
            lines: (0..config.sets)
                .map(|_| vec![CacheLine::empty(words); config.ways])
                .collect(),
            lru: (0..config.sets).map(|_| (0..config.ways).collect()).collect(),
        }
    }

    pub fn geometry(&self) -> &CacheGeometry {
        &self.geometry
    }

    pub fn find(&self, set: usize, tag: u32) -> Option<usize> {
        self.lines[set]
            .iter()
            .position(|line| line.valid && line.tag == tag)
    }

    /// Set and way currently holding the block of `addr`.
    pub fn lookup(&self, addr: Addr) -> Option<(usize, usize)> {
        let set = self.geometry.set_index(addr);
        self.find(set, self.geometry.tag(addr)).map(|way| (set, way))
    }

    /// Way to replace in `set`: an invalid way if one exists, otherwise the LRU way.
    pub fn victim(&self, set: usize) -> usize {
        if let Some(way) = self.lines[set].iter().position(|line| !line.valid) {
            return way;
        }
        *self.lru[set].last().expect("set has at least one way")
    }

    pub fn line(&self, set: usize, way: usize) -> &CacheLine {
        &self.lines[set][way]
    }

    pub fn touch(&mut self, set: usize, way: usize) {
        let order = &mut self.lru[set];
        if let Some(pos) = order.iter().position(|&idx| idx == way) {
            order.remove(pos);
        }
        order.insert(0, way);
    }

    pub fn write_word(&mut self, set: usize, way: usize, offset: usize, word: Word) {
        let line = &mut self.lines[set][way];
        debug_assert!(line.valid, "write to an invalid line");
        line.data[offset] = word;
        line.dirty = true;
    }

    /// Install a clean block. The way being replaced must already be written back.
    pub fn fill(&mut self, set: usize, way: usize, tag: u32, block: Vec<Word>) {
        assert!(
            self.lines[set]
                .iter()
                .enumerate()
                .all(|(w, line)| w == way || !line.valid || line.tag != tag),
            "block {:#x} already resident in set {}",
            self.geometry.rebuild(tag, set),
            set
        );
        let line = &mut self.lines[set][way];
        assert!(!(line.valid && line.dirty), "filling over a dirty line");
        debug_assert_eq!(line.data.len(), block.len());
        *line = CacheLine {
            tag,
            valid: true,
            dirty: false,
            data: block,
        };
        self.touch(set, way);
    }

    /// Update a resident word without changing its dirty bit.
    pub fn patch_word(&mut self, set: usize, way: usize, offset: usize, word: Word) {
        self.lines[set][way].data[offset] = word;
    }

    pub fn mark_clean(&mut self, set: usize, way: usize) {
        self.lines[set][way].dirty = false;
    }

    /// (set, way, block address) of every dirty line.
    pub fn dirty_lines(&self) -> Vec<(usize, usize, Addr)> {
        let mut dirty = Vec::new();
        for (set, lines) in self.lines.iter().enumerate() {
            for (way, line) in lines.iter().enumerate() {
                if line.valid && line.dirty {
                    dirty.push((set, way, self.geometry.rebuild(line.tag, set)));
                }
            }
        }
        dirty
    }

    pub fn invalidate_all(&mut self) {
        for set_idx in 0..self.sets {
            for way in 0..self.ways {
                let line = &mut self.lines[set_idx][way];
                line.valid = false;
                line.dirty = false;
            }
            self.lru[set_idx].clear();
            self.lru[set_idx].extend(0..self.ways);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(sets: usize, ways: usize) -> CacheConfig {
        CacheConfig {
            sets,
            ways,
            block_bytes: 16,
            backing_latency: 1,
        }
    }

    fn block(fill: Word) -> Vec<Word> {
        vec![fill; 4]
    }

    #[test]
    fn geometry_splits_and_rebuilds_addresses() {
        let geometry = CacheGeometry::new(&config(4, 1));
        let addr = 0x1234;
        let set = geometry.set_index(addr);
        assert_eq!(3, set);
        assert_eq!(1, geometry.word_offset(addr));
        assert_eq!(0x1230, geometry.block_addr(addr));
        assert_eq!(0x1230, geometry.rebuild(geometry.tag(addr), set));
    }

    #[test]
    fn invalid_way_is_preferred_victim() {
        let mut cache = CacheArray::new(&config(1, 2));
        assert_eq!(0, cache.victim(0));
        cache.fill(0, 0, 7, block(1));
        assert_eq!(1, cache.victim(0));
    }

    #[test]
    fn least_recently_used_way_is_evicted() {
        let mut cache = CacheArray::new(&config(1, 2));
        cache.fill(0, 0, 1, block(1));
        cache.fill(0, 1, 2, block(2));
        assert_eq!(0, cache.victim(0));
        cache.touch(0, 0);
        assert_eq!(1, cache.victim(0));
    }

    #[test]
    fn hit_write_marks_line_dirty() {
        let mut cache = CacheArray::new(&config(2, 1));
        cache.fill(1, 0, 3, block(0));
        cache.write_word(1, 0, 2, 0xAA);
        let line = cache.line(1, 0);
        assert!(line.dirty);
        assert_eq!(0xAA, line.data[2]);
        assert_eq!(vec![(1, 0, cache.geometry().rebuild(3, 1))], cache.dirty_lines());
    }

    #[test]
    #[should_panic(expected = "already resident")]
    fn duplicate_tag_in_a_set_is_rejected() {
        let mut cache = CacheArray::new(&config(1, 2));
        cache.fill(0, 0, 5, block(0));
        cache.fill(0, 1, 5, block(0));
    }

    #[test]
    #[should_panic(expected = "dirty line")]
    fn filling_over_dirty_line_is_rejected() {
        let mut cache = CacheArray::new(&config(1, 1));
        cache.fill(0, 0, 5, block(0));
        cache.write_word(0, 0, 0, 1);
        cache.fill(0, 0, 6, block(0));
    }

    #[test]
    fn invalidate_all_clears_entire_cache() {
        let mut cache = CacheArray::new(&config(4, 2));
        cache.fill(0, 0, 1, block(1));
        cache.fill(2, 1, 2, block(2));
        cache.invalidate_all();
        assert!(cache.find(0, 1).is_none());
        assert!(cache.find(2, 2).is_none());
    }
}
