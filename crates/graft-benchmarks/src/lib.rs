//! Graft benchmarking suite
//!
//! Benchmarks for capability lookup, resolution and the bundle lifecycle.

pub mod common;

pub use common::*;
