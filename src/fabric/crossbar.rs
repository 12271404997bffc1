use anyhow::{bail, ensure};
use serde::Serialize;
use smallvec::SmallVec;

use crate::base::behavior::Clocked;
use crate::fabric::arbiter::PriorityArbiter;
use crate::fabric::config::RegionConfig;
use crate::fabric::types::{Addr, BusResponse, DestId, Grant, SourceId, Transaction};

/// Non-overlapping address regions, one per destination. Destination ids are region indices.
#[derive(Debug, Clone)]
pub struct AddressMap {
    regions: Vec<RegionConfig>,
}

impl AddressMap {
    pub fn new(regions: &[RegionConfig]) -> anyhow::Result<Self> {
        ensure!(!regions.is_empty(), "address map needs at least one region");
        for region in regions {
            ensure!(region.size > 0, "region '{}' has zero size", region.name);
        }
        let mut sorted: Vec<&RegionConfig> = regions.iter().collect();
        sorted.sort_by_key(|r| r.base);
        for pair in sorted.windows(2) {
            if pair[0].end() > pair[1].base as u64 {
                bail!("regions '{}' and '{}' overlap", pair[0].name, pair[1].name);
            }
        }
        Ok(Self {
            regions: regions.to_vec(),
        })
    }

    /// Destination and in-region offset of `addr`, or `None` on a decode miss.
    pub fn decode(&self, addr: Addr) -> Option<(DestId, Addr)> {
        self.regions
            .iter()
            .position(|r| r.contains(addr))
            .map(|dest| (dest, addr - self.regions[dest].base))
    }

    pub fn region(&self, dest: DestId) -> &RegionConfig {
        &self.regions[dest]
    }

    pub fn regions(&self) -> &[RegionConfig] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GrantStats {
    /// grants[dest][source]
    grants: Vec<Vec<u64>>,
    decode_faults: Vec<u64>,
}

impl GrantStats {
    fn new(num_dests: usize, num_sources: usize) -> Self {
        Self {
            grants: vec![vec![0; num_sources]; num_dests],
            decode_faults: vec![0; num_sources],
        }
    }

    pub fn grants(&self, dest: DestId, source: SourceId) -> u64 {
        self.grants[dest][source]
    }

    pub fn grants_to(&self, source: SourceId) -> u64 {
        self.grants.iter().map(|per_dest| per_dest[source]).sum()
    }

    pub fn total_grants(&self) -> u64 {
        self.grants.iter().flatten().sum()
    }

    pub fn decode_faults(&self, source: SourceId) -> u64 {
        self.decode_faults[source]
    }

    pub fn record_grant(&mut self, dest: DestId, source: SourceId) {
        self.grants[dest][source] = self.grants[dest][source].saturating_add(1);
    }

    pub fn record_fault(&mut self, source: SourceId) {
        self.decode_faults[source] = self.decode_faults[source].saturating_add(1);
    }
}

/// Snapshot signals the crossbar sees in one cycle.
#[derive(Debug, Clone)]
pub struct CrossbarInput {
    /// Presented request per source.
    pub requests: Vec<Option<Transaction>>,
    /// Whether each destination can accept a transaction this cycle.
    pub dest_ready: Vec<bool>,
    /// Completion each destination signals this cycle.
    pub dest_responses: Vec<Option<BusResponse>>,
}

#[derive(Debug, Clone)]
pub struct CrossbarNext {
    /// pending[dest][source]: requesters competing for each destination this cycle.
    pub pending: Vec<Vec<bool>>,
    pub grants: SmallVec<[Grant; 4]>,
    /// Transaction forwarded to each destination, addressed by in-region offset.
    pub forward: Vec<Option<Transaction>>,
    /// Response delivered to each source this cycle.
    pub responses: Vec<Option<BusResponse>>,
    /// Sources whose request missed every region this cycle.
    pub faults: SmallVec<[SourceId; 2]>,
    owners: Vec<Option<SourceId>>,
    poisoned: Vec<Option<BusResponse>>,
}

/// Address router with one priority arbiter per destination.
///
/// A destination holds at most one transaction; its owner is recorded at grant time and the
/// destination's response is routed to that owner and nobody else. A request that decodes to no
/// region is answered with a poison response the following cycle.
#[derive(Debug)]
pub struct Crossbar {
    map: AddressMap,
    num_sources: usize,
    arbiters: Vec<PriorityArbiter>,
    owners: Vec<Option<SourceId>>,
    poisoned: Vec<Option<BusResponse>>,
    stats: GrantStats,
}

impl Crossbar {
    pub fn new(map: AddressMap, num_sources: usize, cpu: SourceId) -> Self {
        let num_dests = map.len();
        Self {
            arbiters: (0..num_dests)
                .map(|_| PriorityArbiter::new(num_sources, cpu))
                .collect(),
            owners: vec![None; num_dests],
            poisoned: vec![None; num_sources],
            stats: GrantStats::new(num_dests, num_sources),
            num_sources,
            map,
        }
    }

    pub fn map(&self) -> &AddressMap {
        &self.map
    }

    pub fn arbiter(&self, dest: DestId) -> &PriorityArbiter {
        &self.arbiters[dest]
    }

    pub fn owner(&self, dest: DestId) -> Option<SourceId> {
        self.owners[dest]
    }

    pub fn stats(&self) -> &GrantStats {
        &self.stats
    }

    /// Whether `source` has a transaction in flight or a poison response queued.
    pub fn is_engaged(&self, source: SourceId) -> bool {
        self.poisoned[source].is_some() || self.owners.iter().any(|o| *o == Some(source))
    }

    pub fn reset(&mut self) {
        self.arbiters.iter_mut().for_each(PriorityArbiter::reset);
        self.owners.iter_mut().for_each(|o| *o = None);
        self.poisoned.iter_mut().for_each(|p| *p = None);
        self.stats = GrantStats::new(self.map.len(), self.num_sources);
    }
}

impl Clocked for Crossbar {
    type Input = CrossbarInput;
    type Next = CrossbarNext;

    fn evaluate(&self, input: &CrossbarInput) -> CrossbarNext {
        let num_dests = self.map.len();
        debug_assert_eq!(input.requests.len(), self.num_sources);
        debug_assert_eq!(input.dest_ready.len(), num_dests);

        let mut next = CrossbarNext {
            pending: vec![vec![false; self.num_sources]; num_dests],
            grants: SmallVec::new(),
            forward: vec![None; num_dests],
            responses: vec![None; self.num_sources],
            faults: SmallVec::new(),
            owners: self.owners.clone(),
            poisoned: vec![None; self.num_sources],
        };

        // return path
        for (dest, response) in input.dest_responses.iter().enumerate() {
            if let Some(response) = response {
                let owner = self.owners[dest].expect("response from a destination with no owner");
                debug_assert_eq!(input.requests[owner].map(|r| r.id), Some(response.id));
                next.responses[owner] = Some(*response);
                next.owners[dest] = None;
            }
        }
        for (source, poison) in self.poisoned.iter().enumerate() {
            if let Some(poison) = poison {
                next.responses[source] = Some(*poison);
            }
        }

        // decode
        let mut decoded: Vec<Option<(DestId, Addr)>> = vec![None; self.num_sources];
        for (source, request) in input.requests.iter().enumerate() {
            let Some(request) = request else { continue };
            if self.is_engaged(source) {
                continue;
            }
            match self.map.decode(request.addr) {
                Some((dest, offset)) => {
                    next.pending[dest][source] = true;
                    decoded[source] = Some((dest, offset));
                }
                None => {
                    next.poisoned[source] = Some(BusResponse::poison(request.id));
                    next.faults.push(source);
                }
            }
        }

        // arbitrate, one grant per ready destination
        for dest in 0..num_dests {
            if !input.dest_ready[dest] || self.owners[dest].is_some() {
                continue;
            }
            let Some(source) = self.arbiters[dest].select(&next.pending[dest]) else {
                continue;
            };
            let txn = input.requests[source].expect("granted a source with no request");
            let (_, offset) = decoded[source].expect("granted a source that did not decode");
            next.forward[dest] = Some(txn.at_offset(offset));
            next.owners[dest] = Some(source);
            next.grants.push(Grant { dest, source, txn });
        }

        next
    }

    fn commit(&mut self, next: CrossbarNext) {
        for dest in 0..self.arbiters.len() {
            let grant = next.grants.iter().find(|g| g.dest == dest).map(|g| g.source);
            self.arbiters[dest].commit(grant);
        }
        for grant in &next.grants {
            self.stats.record_grant(grant.dest, grant.source);
        }
        for &source in &next.faults {
            self.stats.record_fault(source);
        }
        self.owners = next.owners;
        self.poisoned = next.poisoned;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::config::RegionKind;
    use crate::fabric::types::POISON_WORD;

    const SOURCES: usize = 3;
    const CPU: usize = 2;

    fn crossbar() -> Crossbar {
        let map = AddressMap::new(&[
            RegionConfig::new("main", 0x0, 0x1000, RegionKind::Memory),
            RegionConfig::new("regs", 0x8000, 0x100, RegionKind::Registers),
        ])
        .unwrap();
        Crossbar::new(map, SOURCES, CPU)
    }

    fn input(requests: Vec<Option<Transaction>>) -> CrossbarInput {
        CrossbarInput {
            requests,
            dest_ready: vec![true, true],
            dest_responses: vec![None, None],
        }
    }

    #[test]
    fn decode_returns_region_offset() {
        let xbar = crossbar();
        assert_eq!(Some((0, 0x10)), xbar.map().decode(0x10));
        assert_eq!(Some((1, 0x4)), xbar.map().decode(0x8004));
        assert_eq!(None, xbar.map().decode(0x8100));
    }

    #[test]
    fn different_destinations_grant_in_the_same_cycle() {
        let xbar = crossbar();
        let next = xbar.evaluate(&input(vec![
            Some(Transaction::read(0, 0, 0x20)),
            Some(Transaction::read(1, 0, 0x8008)),
            None,
        ]));
        assert_eq!(2, next.grants.len());
        assert_eq!(Some(0x20), next.forward[0].map(|t| t.addr));
        assert_eq!(Some(0x8), next.forward[1].map(|t| t.addr));
    }

    #[test]
    fn same_destination_is_serialized() {
        let mut xbar = crossbar();
        let requests = vec![
            Some(Transaction::read(0, 0, 0x20)),
            Some(Transaction::read(1, 0, 0x40)),
            Some(Transaction::read(CPU, 0, 0x60)),
        ];
        let next = xbar.evaluate(&input(requests.clone()));
        assert_eq!(1, next.grants.len());
        assert_eq!(0, next.grants[0].source);
        xbar.commit(next);
        assert_eq!(Some(0), xbar.owner(0));

        // destination busy: no new grant until the owner's response is routed
        let next = xbar.evaluate(&input(requests.clone()));
        assert!(next.grants.is_empty());
        xbar.commit(next);

        let mut done = input(requests);
        done.dest_ready[0] = false;
        done.dest_responses[0] = Some(BusResponse::ok(0, 0x1234));
        let next = xbar.evaluate(&done);
        assert_eq!(Some(BusResponse::ok(0, 0x1234)), next.responses[0]);
        assert!(next.responses[1].is_none() && next.responses[2].is_none());
        xbar.commit(next);
        assert_eq!(None, xbar.owner(0));
    }

    #[test]
    fn decode_miss_is_poisoned_next_cycle() {
        let mut xbar = crossbar();
        let requests = vec![None, None, Some(Transaction::read(CPU, 9, 0xF000))];
        let next = xbar.evaluate(&input(requests.clone()));
        assert!(next.grants.is_empty());
        assert!(next.responses[CPU].is_none());
        assert_eq!(&[CPU], next.faults.as_slice());
        xbar.commit(next);
        assert!(xbar.is_engaged(CPU));

        let next = xbar.evaluate(&input(requests));
        let response = next.responses[CPU].expect("poison response");
        assert!(response.error);
        assert_eq!(POISON_WORD, response.data);
        assert_eq!(9, response.id);
        assert!(next.faults.is_empty(), "fault must not be raised twice");
        xbar.commit(next);
        assert_eq!(1, xbar.stats().decode_faults(CPU));
        assert!(!xbar.is_engaged(CPU));
    }

    #[test]
    fn unready_destination_freezes_its_arbiter() {
        let mut xbar = crossbar();
        let mut stalled = input(vec![Some(Transaction::read(1, 0, 0x0)), None, None]);
        stalled.dest_ready[0] = false;
        let next = xbar.evaluate(&stalled);
        assert!(next.grants.is_empty());
        assert!(next.pending[0][1]);
        xbar.commit(next);
        assert_eq!(0, xbar.arbiter(0).pointer());
    }
}
