//! # graft-core
//!
//! Core types shared across all Graft crates.
//!
//! This crate provides:
//! - Version and VersionRange types for module versions
//! - LDAP-style filters, capabilities and requirements
//! - Module descriptors, the declarative input of a module revision
//! - GraftError enum for unified error handling
//!
//! ## Architecture
//!
//! The crate is organized into modules:
//! - `types`: Core data types (Version, Capability, Requirement, etc.)
//! - `error`: Error types and result aliases

pub mod error;
pub mod types;

// Re-export commonly used types
pub use error::{GraftError, GraftResult};
pub use types::{
    BundleId, BundleState, Capability, Filter, ModuleDescriptor, ModuleId, Namespace,
    PersistentState, Requirement, Version, VersionRange,
};
