use crate::fabric::types::SourceId;

/// Priority arbiter for one destination.
///
/// Compute-unit requesters form the GPU group and always win over the scalar core. Within the
/// GPU group grants rotate from the round-robin pointer. The scalar core is granted only when
/// no GPU requester is pending, so a saturated GPU group starves it.
#[derive(Debug, Clone)]
pub struct PriorityArbiter {
    size: usize,
    cpu: SourceId,
    pointer: usize,
}

impl PriorityArbiter {
    pub fn new(size: usize, cpu: SourceId) -> Self {
        assert!(size > 0, "arbiter needs at least one requester");
        assert!(cpu < size, "cpu index {} outside {} requesters", cpu, size);
        Self {
            size,
            cpu,
            pointer: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pointer(&self) -> usize {
        self.pointer
    }

    /// Pick the winner among `pending` without changing any state.
    pub fn select(&self, pending: &[bool]) -> Option<SourceId> {
        debug_assert_eq!(pending.len(), self.size);
        if let Some(gpu) = self.scan(pending, |idx| idx != self.cpu) {
            return Some(gpu);
        }
        if pending[self.cpu] {
            return Some(self.cpu);
        }
        // unreachable given the two rules above; plain round-robin over everyone
        self.scan(pending, |_| true)
    }

    /// Advance the pointer past the granted index. No grant leaves the pointer frozen.
    pub fn commit(&mut self, grant: Option<SourceId>) {
        if let Some(granted) = grant {
            self.pointer = (granted + 1) % self.size;
        }
    }

    pub fn reset(&mut self) {
        self.pointer = 0;
    }

    fn scan(&self, pending: &[bool], eligible: impl Fn(usize) -> bool) -> Option<SourceId> {
        (0..self.size)
            .map(|offset| (self.pointer + offset) % self.size)
            .find(|&idx| pending[idx] && eligible(idx))
    }
}
