//! Capability index and dependency resolution state for Graft
//!
//! This crate provides the attribute-indexed capability store, the module
//! graph with its wires and reverse edges, the resolver state that handles
//! singleton selection and fragment merging, and a reference solver.

pub mod capset;
pub mod graph;
pub mod solver;
pub mod state;

// Re-export main types
pub use capset::CapabilitySet;
pub use graph::{Module, ModuleGraph, Wire};
pub use solver::{GreedySolver, Solver};
pub use state::{system_exports, ResolverState, WireMap};

use graft_core::error::GraftError;

/// Result type for resolver operations
pub type ResolverResult<T> = Result<T, GraftError>;
