#[cfg(test)]
mod fabric_tests;
#[cfg(test)]
mod harness;
