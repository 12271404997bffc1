use serde::Serialize;

pub type SourceId = usize;
pub type DestId = usize;
pub type Addr = u32;
pub type Word = u32;

pub const WORD_BYTES: u32 = 4;

/// Read data returned with a decode-fault response.
pub const POISON_WORD: Word = 0xDEAD_BEEF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BusOp {
    Read,
    Write,
}

impl BusOp {
    pub fn short(self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::Write => "w",
        }
    }
}

/// A bus request. While a source presents `Some(Transaction)` it is `valid`; the source holds
/// it unchanged until the matching response arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    pub source: SourceId,
    pub id: u64,
    pub addr: Addr,
    pub op: BusOp,
    pub data: Word,
}

impl Transaction {
    pub fn read(source: SourceId, id: u64, addr: Addr) -> Self {
        Self {
            source,
            id,
            addr,
            op: BusOp::Read,
            data: 0,
        }
    }

    pub fn write(source: SourceId, id: u64, addr: Addr, data: Word) -> Self {
        Self {
            source,
            id,
            addr,
            op: BusOp::Write,
            data,
        }
    }

    pub fn is_write(&self) -> bool {
        self.op == BusOp::Write
    }

    /// Same transaction retargeted at an offset inside its destination region.
    pub fn at_offset(self, offset: Addr) -> Self {
        Self { addr: offset, ..self }
    }
}

/// A bus response: present for exactly one cycle per completed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusResponse {
    pub id: u64,
    pub data: Word,
    pub error: bool,
}

impl BusResponse {
    pub fn ok(id: u64, data: Word) -> Self {
        Self {
            id,
            data,
            error: false,
        }
    }

    pub fn poison(id: u64) -> Self {
        Self {
            id,
            data: POISON_WORD,
            error: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub dest: DestId,
    pub source: SourceId,
    pub txn: Transaction,
}

/// A destination on the crossbar.
///
/// `ready` and `response` expose committed state only; `clock` is the commit step and receives
/// the transaction granted to this destination in the cycle being committed.
pub trait BusTarget {
    fn name(&self) -> &str;

    fn ready(&self) -> bool;

    fn response(&self) -> Option<BusResponse>;

    fn clock(&mut self, accept: Option<Transaction>);
}
