//! Bundle archive persistence for Graft
//!
//! This crate stores installed bundles: their location, persistent state,
//! start level and the content of every revision. Revision content is
//! hashed with Blake3 so the directory-backed cache can detect corruption.

pub mod archive;

// Re-export main types
pub use archive::{
    compute_hash, BundleArchive, BundleCache, ContentHash, DirCache, MemoryCache, RevisionEntry,
};

use graft_core::error::GraftError;

/// Result type for cache operations
pub type CacheResult<T> = Result<T, GraftError>;
