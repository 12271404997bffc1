pub mod config;
mod conv;
mod tiled;

pub use config::{ConvConfig, WorkloadConfig};
pub use conv::{Conv2d, ConvReport};
pub use tiled::{TiledMatmul, WorkloadReport};
