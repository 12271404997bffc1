mod array;
pub mod unit;

pub use array::{ArrayNext, ComputeArray};
pub use unit::{activation_cycles, ComputeUnit, Operands, Phase, UnitStatus, DIM};
