use std::collections::HashMap;
use std::sync::Arc;

use crate::base::behavior::Parameterizable;
use crate::base::module::{module, IsModule, ModuleBase};
use crate::fabric::config::RegionConfig;
use crate::fabric::types::{Addr, BusResponse, BusTarget, Transaction, Word};

#[derive(Debug, Default)]
pub struct RegisterFileState {
    words: HashMap<Addr, Word>,
    response: Option<BusResponse>,
}

/// Plain word-storage destination for register regions. Reads of never-written offsets return
/// zero; every access completes the cycle after it is granted.
#[derive(Debug)]
pub struct RegisterFile {
    base: ModuleBase<RegisterFileState, RegionConfig>,
}

module!(RegisterFile, RegisterFileState, RegionConfig,);

impl RegisterFile {
    pub fn new(config: Arc<RegionConfig>) -> Self {
        let mut me = RegisterFile {
            base: ModuleBase::default(),
        };
        me.init_conf(config);
        me
    }

    pub fn peek(&self, offset: Addr) -> Word {
        self.state().words.get(&(offset & !0x3)).copied().unwrap_or(0)
    }

    pub fn poke(&mut self, offset: Addr, word: Word) {
        self.state_mut().words.insert(offset & !0x3, word);
    }

    pub fn reset(&mut self) {
        let state = self.state_mut();
        state.words.clear();
        state.response = None;
    }
}

impl BusTarget for RegisterFile {
    fn name(&self) -> &str {
        &self.conf().name
    }

    fn ready(&self) -> bool {
        self.state().response.is_none()
    }

    fn response(&self) -> Option<BusResponse> {
        self.state().response
    }

    fn clock(&mut self, accept: Option<Transaction>) {
        let response = accept.map(|txn| {
            let offset = txn.addr & !0x3;
            if txn.is_write() {
                self.state_mut().words.insert(offset, txn.data);
                BusResponse::ok(txn.id, 0)
            } else {
                BusResponse::ok(txn.id, self.peek(offset))
            }
        });
        self.state_mut().response = response;
        self.base.cycle += 1;
    }
}
