//! Bundle archives
//!
//! A [`BundleArchive`] is the persisted record of one installed bundle: its
//! location, persistent state, start level and the content hashes of its
//! revisions. The [`BundleCache`] trait stores archives together with the
//! revision contents; [`MemoryCache`] and [`DirCache`] implement it.

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use graft_core::error::GraftError;
use graft_core::types::{BundleId, PersistentState};

use crate::CacheResult;

pub mod dir;
pub mod hash;
pub mod memory;

pub use dir::DirCache;
pub use hash::{compute_hash, ContentHash};
pub use memory::MemoryCache;

/// One stored revision of a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionEntry {
    pub number: u32,
    pub hash: ContentHash,
    pub size: u64,
    /// Unix timestamp of when the revision was stored
    pub stored_at: i64,
}

impl RevisionEntry {
    pub fn new(number: u32, content: &[u8]) -> Self {
        Self {
            number,
            hash: compute_hash(content),
            size: content.len() as u64,
            stored_at: Utc::now().timestamp(),
        }
    }
}

/// Persisted record of an installed bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BundleArchive {
    pub id: BundleId,
    pub location: String,
    #[serde(default)]
    pub persistent_state: PersistentState,
    pub start_level: u32,
    /// Stored revisions, oldest first; never empty
    pub revisions: Vec<RevisionEntry>,
    pub last_modified: DateTime<Utc>,
}

impl BundleArchive {
    /// Create an archive holding revision 0 of `content`
    pub fn new(id: BundleId, location: impl Into<String>, start_level: u32, content: &[u8]) -> Self {
        Self {
            id,
            location: location.into(),
            persistent_state: PersistentState::Installed,
            start_level,
            revisions: vec![RevisionEntry::new(0, content)],
            last_modified: Utc::now(),
        }
    }

    /// Most recent revision
    pub fn current_revision(&self) -> Option<&RevisionEntry> {
        self.revisions.last()
    }

    pub fn revision(&self, number: u32) -> Option<&RevisionEntry> {
        self.revisions.iter().find(|r| r.number == number)
    }

    /// Append a revision numbered after the newest one
    pub(crate) fn push_revision(&mut self, content: &[u8]) -> u32 {
        let number = self
            .current_revision()
            .map(|r| r.number + 1)
            .unwrap_or_default();
        self.revisions.push(RevisionEntry::new(number, content));
        self.last_modified = Utc::now();
        number
    }

    /// Drop the newest revision, keeping at least one
    pub(crate) fn pop_revision(&mut self) -> Option<RevisionEntry> {
        if self.revisions.len() < 2 {
            return None;
        }
        self.last_modified = Utc::now();
        self.revisions.pop()
    }

    /// Drop every revision but the newest, returning the dropped ones
    pub(crate) fn retain_current(&mut self) -> Vec<RevisionEntry> {
        let keep = self.revisions.len().saturating_sub(1);
        self.revisions.drain(..keep).collect()
    }
}

/// Storage for bundle archives and revision content
pub trait BundleCache: Send + Sync {
    /// Store a new bundle at revision 0
    fn create(
        &self,
        id: BundleId,
        location: &str,
        start_level: u32,
        content: &[u8],
    ) -> CacheResult<BundleArchive>;

    /// Snapshot of a bundle's archive
    fn archive(&self, id: BundleId) -> Option<BundleArchive>;

    /// All stored archives in ascending id order
    fn archives(&self) -> Vec<BundleArchive>;

    /// Content of one revision
    fn revision(&self, id: BundleId, number: u32) -> CacheResult<Vec<u8>>;

    /// Store new content as the bundle's next revision
    fn revise(&self, id: BundleId, content: &[u8]) -> CacheResult<u32>;

    /// Drop the revision added by the last `revise`
    fn undo_revise(&self, id: BundleId) -> CacheResult<()>;

    /// Drop every revision but the current one
    fn purge(&self, id: BundleId) -> CacheResult<()>;

    /// Delete the bundle's archive and content
    fn remove(&self, id: BundleId) -> CacheResult<()>;

    fn set_persistent_state(&self, id: BundleId, state: PersistentState) -> CacheResult<()>;

    fn set_start_level(&self, id: BundleId, level: u32) -> CacheResult<()>;

    /// Private data directory of a bundle, if the cache has a filesystem
    fn data_dir(&self, id: BundleId) -> Option<Utf8PathBuf>;

    /// Persistent state, falling back to INSTALLED
    fn persistent_state(&self, id: BundleId) -> PersistentState {
        self.archive(id)
            .map(|archive| archive.persistent_state)
            .unwrap_or_default()
    }

    /// Start level, falling back to `default`
    fn start_level(&self, id: BundleId, default: u32) -> u32 {
        self.archive(id)
            .map(|archive| archive.start_level)
            .unwrap_or(default)
    }
}

pub(crate) fn not_found(id: BundleId) -> GraftError {
    GraftError::BundleNotFound { bundle: id }
}
