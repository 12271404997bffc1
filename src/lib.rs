pub mod base;
pub mod compute;
pub mod fabric;
pub mod memctrl;
pub mod sim;
pub mod timeq;
pub mod workload;

#[cfg(test)]
mod unit_tests;
