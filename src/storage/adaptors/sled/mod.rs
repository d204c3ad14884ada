mod sled_engine;

pub use sled_engine::*;

#[cfg(test)]
mod sled_engine_test;
