pub mod arbiter;
pub mod config;
pub mod crossbar;
pub mod regfile;
pub mod scalar;
pub mod types;

pub use arbiter::PriorityArbiter;
pub use crossbar::{AddressMap, Crossbar, CrossbarInput, CrossbarNext, GrantStats};
pub use regfile::RegisterFile;
pub use scalar::ScalarPort;
pub use types::{
    Addr, BusOp, BusResponse, BusTarget, DestId, Grant, SourceId, Transaction, Word, POISON_WORD,
};
