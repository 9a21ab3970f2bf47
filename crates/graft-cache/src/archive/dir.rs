//! Filesystem bundle cache
//!
//! Layout under the cache root:
//!
//! ```text
//! index.json                 archive records of every bundle
//! bundles/<id>/revision.<n>  content of revision n
//! bundles/<id>/data/         private data directory
//! ```
//!
//! The index is rewritten after every mutation, through a temporary file
//! renamed over the old index. Revision content is checked against its
//! recorded Blake3 hash when read back.

use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use graft_core::error::GraftError;
use graft_core::types::{BundleId, PersistentState};

use super::hash::compute_hash;
use super::{not_found, BundleArchive, BundleCache};
use crate::CacheResult;

const INDEX_FILE: &str = "index.json";

/// Bundle cache rooted at a directory
#[derive(Debug)]
pub struct DirCache {
    root_path: Utf8PathBuf,
    archives: DashMap<BundleId, BundleArchive>,
    /// Held from snapshot to rename so the newest snapshot lands last
    index_lock: Mutex<()>,
}

impl DirCache {
    /// Open the cache at `root_path`, creating it if needed.
    ///
    /// An index that exists but cannot be read or parsed is an error, so a
    /// damaged cache is never silently replaced by an empty one.
    pub fn open<P: AsRef<Utf8Path>>(root_path: P) -> CacheResult<Self> {
        let root_path = root_path.as_ref().to_path_buf();
        fs::create_dir_all(&root_path)
            .map_err(|e| GraftError::io(format!("Failed to create cache directory {}", root_path), e))?;

        let archives = DashMap::new();
        let index_path = root_path.join(INDEX_FILE);
        if index_path.exists() {
            let content = fs::read_to_string(&index_path)
                .map_err(|e| GraftError::io(format!("Failed to read cache index {}", index_path), e))?;
            let loaded: Vec<BundleArchive> = serde_json::from_str(&content).map_err(|e| {
                GraftError::io(
                    format!("Failed to parse cache index {}", index_path),
                    std::io::Error::new(std::io::ErrorKind::InvalidData, e),
                )
            })?;
            for archive in loaded {
                archives.insert(archive.id, archive);
            }
        }
        debug!("Opened bundle cache at {} with {} archive(s)", root_path, archives.len());

        Ok(Self {
            root_path,
            archives,
            index_lock: Mutex::new(()),
        })
    }

    pub fn root_path(&self) -> &Utf8Path {
        &self.root_path
    }

    fn bundle_dir(&self, id: BundleId) -> Utf8PathBuf {
        self.root_path.join("bundles").join(id.to_string())
    }

    fn revision_path(&self, id: BundleId, number: u32) -> Utf8PathBuf {
        self.bundle_dir(id).join(format!("revision.{}", number))
    }

    fn write_revision(&self, id: BundleId, number: u32, content: &[u8]) -> CacheResult<()> {
        let path = self.revision_path(id, number);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| GraftError::io("Failed to create bundle directory", e))?;
        }
        fs::write(&path, content)
            .map_err(|e| GraftError::io(format!("Failed to write {}", path), e))
    }

    fn remove_revision(&self, id: BundleId, number: u32) {
        let path = self.revision_path(id, number);
        if let Err(e) = fs::remove_file(&path) {
            warn!("Failed to delete {}: {}", path, e);
        }
    }

    /// Rewrite the index file
    fn save(&self) -> CacheResult<()> {
        let _index = self.index_lock.lock();
        let mut archives: Vec<BundleArchive> =
            self.archives.iter().map(|entry| entry.value().clone()).collect();
        archives.sort_by_key(|archive| archive.id);

        let content = serde_json::to_string_pretty(&archives).map_err(|e| {
            GraftError::io(
                "Failed to serialize cache index",
                std::io::Error::new(std::io::ErrorKind::Other, e),
            )
        })?;

        let mut temp = NamedTempFile::new_in(&self.root_path)
            .map_err(|e| GraftError::io("Failed to create temporary cache index", e))?;
        temp.write_all(content.as_bytes())
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|e| GraftError::io("Failed to write cache index", e))?;
        temp.persist(self.root_path.join(INDEX_FILE))
            .map_err(|e| GraftError::io("Failed to replace cache index", e.error))?;
        Ok(())
    }

    fn update<R>(&self, id: BundleId, f: impl FnOnce(&mut BundleArchive) -> R) -> CacheResult<R> {
        let result = {
            let mut archive = self.archives.get_mut(&id).ok_or_else(|| not_found(id))?;
            f(&mut archive)
        };
        self.save()?;
        Ok(result)
    }
}

impl BundleCache for DirCache {
    fn create(
        &self,
        id: BundleId,
        location: &str,
        start_level: u32,
        content: &[u8],
    ) -> CacheResult<BundleArchive> {
        self.write_revision(id, 0, content)?;
        let archive = BundleArchive::new(id, location, start_level, content);
        self.archives.insert(id, archive.clone());
        if let Err(e) = self.save() {
            self.archives.remove(&id);
            self.remove_revision(id, 0);
            return Err(e);
        }
        Ok(archive)
    }

    fn archive(&self, id: BundleId) -> Option<BundleArchive> {
        self.archives.get(&id).map(|entry| entry.value().clone())
    }

    fn archives(&self) -> Vec<BundleArchive> {
        let mut archives: Vec<BundleArchive> =
            self.archives.iter().map(|entry| entry.value().clone()).collect();
        archives.sort_by_key(|archive| archive.id);
        archives
    }

    fn revision(&self, id: BundleId, number: u32) -> CacheResult<Vec<u8>> {
        let expected = self
            .archives
            .get(&id)
            .and_then(|archive| archive.revision(number).map(|r| r.hash))
            .ok_or_else(|| not_found(id))?;

        let path = self.revision_path(id, number);
        let content =
            fs::read(&path).map_err(|e| GraftError::io(format!("Failed to read {}", path), e))?;
        let actual = compute_hash(&content);
        if actual != expected {
            return Err(GraftError::IntegrityFailure {
                bundle: format!("{} revision {}", id, number),
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(content)
    }

    fn revise(&self, id: BundleId, content: &[u8]) -> CacheResult<u32> {
        let number = self
            .archives
            .get(&id)
            .and_then(|archive| archive.current_revision().map(|r| r.number + 1))
            .ok_or_else(|| not_found(id))?;
        self.write_revision(id, number, content)?;

        match self.update(id, |archive| archive.push_revision(content)) {
            Ok(pushed) => Ok(pushed),
            Err(e) => {
                self.remove_revision(id, number);
                Err(e)
            }
        }
    }

    fn undo_revise(&self, id: BundleId) -> CacheResult<()> {
        if let Some(dropped) = self.update(id, BundleArchive::pop_revision)? {
            self.remove_revision(id, dropped.number);
        }
        Ok(())
    }

    fn purge(&self, id: BundleId) -> CacheResult<()> {
        for dropped in self.update(id, BundleArchive::retain_current)? {
            self.remove_revision(id, dropped.number);
        }
        Ok(())
    }

    fn remove(&self, id: BundleId) -> CacheResult<()> {
        self.archives.remove(&id);
        self.save()?;
        let dir = self.bundle_dir(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .map_err(|e| GraftError::io(format!("Failed to delete {}", dir), e))?;
        }
        Ok(())
    }

    fn set_persistent_state(&self, id: BundleId, state: PersistentState) -> CacheResult<()> {
        self.update(id, |archive| archive.persistent_state = state)
    }

    fn set_start_level(&self, id: BundleId, level: u32) -> CacheResult<()> {
        self.update(id, |archive| archive.start_level = level)
    }

    fn data_dir(&self, id: BundleId) -> Option<Utf8PathBuf> {
        let dir = self.bundle_dir(id).join("data");
        match fs::create_dir_all(&dir) {
            Ok(()) => Some(dir),
            Err(e) => {
                warn!("Failed to create data directory {}: {}", dir, e);
                None
            }
        }
    }
}
