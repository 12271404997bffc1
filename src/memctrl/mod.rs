pub mod backing;
pub mod cache;
pub mod config;
mod controller;
mod stats;

pub use backing::{BackingOp, BackingStore};
pub use config::CacheConfig;
pub use controller::{CtrlPhase, MemoryController};
pub use stats::CacheStats;
