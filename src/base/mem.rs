use anyhow::bail;

use crate::fabric::types::{Addr, Word};

/// Trait for simulated word-addressable memories.
pub trait HasMemory {
    fn size(&self) -> usize;

    fn read_impl(&self, addr: usize, n: usize) -> Result<&[u8], anyhow::Error>;

    fn read(&self, addr: usize, n: usize) -> Result<&[u8], anyhow::Error> {
        // the fabric itself must maintain these invariants
        assert!((n % 4 == 0) && n > 0, "word sized reads only");

        if addr & 0x3 != 0 {
            bail!("unaligned memory read of size {} @ {:#010x}", n, addr);
        }
        if addr + n > self.size() {
            bail!("memory read of size {} @ {:#010x} past end {:#010x}", n, addr, self.size());
        }

        self.read_impl(addr, n)
    }

    fn write_impl(&mut self, addr: usize, data: &[u8]) -> Result<(), anyhow::Error>;

    fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), anyhow::Error> {
        let n = data.len();
        assert!((n % 4 == 0) && n > 0, "stores must be an integer number of words");

        if addr & 0x3 != 0 {
            bail!("unaligned memory write of size {} @ {:#010x}", n, addr);
        }
        if addr + n > self.size() {
            bail!("memory write of size {} @ {:#010x} past end {:#010x}", n, addr, self.size());
        }

        self.write_impl(addr, data)
    }

    fn read_word(&self, addr: Addr) -> Result<Word, anyhow::Error> {
        let bytes = self.read(addr as usize, 4)?;
        Ok(Word::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn write_word(&mut self, addr: Addr, word: Word) -> Result<(), anyhow::Error> {
        self.write(addr as usize, &word.to_le_bytes())
    }

    fn read_words(&self, addr: Addr, count: usize) -> Result<Vec<Word>, anyhow::Error> {
        let bytes = self.read(addr as usize, count * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|w| Word::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect())
    }

    fn write_words(&mut self, addr: Addr, words: &[Word]) -> Result<(), anyhow::Error> {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.write(addr as usize, &bytes)
    }
}
