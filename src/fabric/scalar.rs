use std::collections::VecDeque;

use crate::base::behavior::Clocked;
use crate::fabric::types::{Addr, BusOp, BusResponse, SourceId, Transaction, Word};

/// One scripted access of the scalar core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalarOp {
    pub op: BusOp,
    pub addr: Addr,
    pub data: Word,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalarCompletion {
    pub txn: Transaction,
    pub response: BusResponse,
}

/// Memory port of the scalar core.
///
/// The instruction pipeline itself lives outside the fabric; this port replays its memory
/// accesses in program order with at most one transaction outstanding.
#[derive(Debug)]
pub struct ScalarPort {
    source: SourceId,
    queue: VecDeque<ScalarOp>,
    next_id: u64,
    completed: Vec<ScalarCompletion>,
}

impl ScalarPort {
    pub fn new(source: SourceId) -> Self {
        Self {
            source,
            queue: VecDeque::new(),
            next_id: 0,
            completed: Vec::new(),
        }
    }

    pub fn push_read(&mut self, addr: Addr) {
        self.queue.push_back(ScalarOp {
            op: BusOp::Read,
            addr,
            data: 0,
        });
    }

    pub fn push_write(&mut self, addr: Addr, data: Word) {
        self.queue.push_back(ScalarOp {
            op: BusOp::Write,
            addr,
            data,
        });
    }

    /// The presented request; identical every cycle until it is acknowledged.
    pub fn request(&self) -> Option<Transaction> {
        self.queue.front().map(|op| Transaction {
            source: self.source,
            id: self.next_id,
            addr: op.addr,
            op: op.op,
            data: op.data,
        })
    }

    pub fn idle(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn completed(&self) -> &[ScalarCompletion] {
        &self.completed
    }

    pub fn take_completed(&mut self) -> Vec<ScalarCompletion> {
        std::mem::take(&mut self.completed)
    }

    pub fn reset(&mut self) {
        self.queue.clear();
        self.completed.clear();
        self.next_id = 0;
    }
}

impl Clocked for ScalarPort {
    type Input = Option<BusResponse>;
    type Next = Option<ScalarCompletion>;

    fn evaluate(&self, response: &Option<BusResponse>) -> Option<ScalarCompletion> {
        let response = (*response)?;
        let txn = self.request().expect("response delivered to an idle scalar port");
        debug_assert_eq!(txn.id, response.id);
        Some(ScalarCompletion { txn, response })
    }

    fn commit(&mut self, next: Option<ScalarCompletion>) {
        if let Some(completion) = next {
            self.queue.pop_front();
            self.next_id += 1;
            self.completed.push(completion);
        }
    }
}
