use crate::base::mem::HasMemory;

/// Flat byte-addressed backing memory.
#[derive(Debug, Clone)]
pub struct FlatMemory {
    bytes: Vec<u8>,
}

impl HasMemory for FlatMemory {
    fn size(&self) -> usize {
        self.bytes.len()
    }

    fn read_impl(&self, addr: usize, n: usize) -> Result<&[u8], anyhow::Error> {
        Ok(&self.bytes[addr..addr + n])
    }

    fn write_impl(&mut self, addr: usize, data: &[u8]) -> Result<(), anyhow::Error> {
        self.bytes[addr..addr + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl FlatMemory {
    pub fn new_with_size(size: usize) -> Self {
        let bytes = vec![0u8; size];
        Self { bytes }
    }

    pub fn clear(&mut self) {
        self.bytes.iter_mut().for_each(|b| *b = 0);
    }
}
