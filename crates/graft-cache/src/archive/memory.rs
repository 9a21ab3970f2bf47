//! In-process bundle cache

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8PathBuf;
use dashmap::DashMap;

use graft_core::types::{BundleId, PersistentState};

use super::{not_found, BundleArchive, BundleCache};
use crate::CacheResult;

#[derive(Debug, Clone)]
struct Entry {
    archive: BundleArchive,
    contents: BTreeMap<u32, Arc<[u8]>>,
}

/// Bundle cache that keeps everything in memory
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<BundleId, Entry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<R>(&self, id: BundleId, f: impl FnOnce(&mut Entry) -> R) -> CacheResult<R> {
        let mut entry = self.entries.get_mut(&id).ok_or_else(|| not_found(id))?;
        Ok(f(&mut entry))
    }
}

impl BundleCache for MemoryCache {
    fn create(
        &self,
        id: BundleId,
        location: &str,
        start_level: u32,
        content: &[u8],
    ) -> CacheResult<BundleArchive> {
        let archive = BundleArchive::new(id, location, start_level, content);
        let mut contents = BTreeMap::new();
        contents.insert(0, Arc::from(content));
        self.entries.insert(
            id,
            Entry {
                archive: archive.clone(),
                contents,
            },
        );
        Ok(archive)
    }

    fn archive(&self, id: BundleId) -> Option<BundleArchive> {
        self.entries.get(&id).map(|entry| entry.archive.clone())
    }

    fn archives(&self) -> Vec<BundleArchive> {
        let mut archives: Vec<BundleArchive> = self
            .entries
            .iter()
            .map(|entry| entry.archive.clone())
            .collect();
        archives.sort_by_key(|archive| archive.id);
        archives
    }

    fn revision(&self, id: BundleId, number: u32) -> CacheResult<Vec<u8>> {
        let entry = self.entries.get(&id).ok_or_else(|| not_found(id))?;
        entry
            .contents
            .get(&number)
            .map(|content| content.to_vec())
            .ok_or_else(|| not_found(id))
    }

    fn revise(&self, id: BundleId, content: &[u8]) -> CacheResult<u32> {
        self.with_entry(id, |entry| {
            let number = entry.archive.push_revision(content);
            entry.contents.insert(number, Arc::from(content));
            number
        })
    }

    fn undo_revise(&self, id: BundleId) -> CacheResult<()> {
        self.with_entry(id, |entry| {
            if let Some(dropped) = entry.archive.pop_revision() {
                entry.contents.remove(&dropped.number);
            }
        })
    }

    fn purge(&self, id: BundleId) -> CacheResult<()> {
        self.with_entry(id, |entry| {
            for dropped in entry.archive.retain_current() {
                entry.contents.remove(&dropped.number);
            }
        })
    }

    fn remove(&self, id: BundleId) -> CacheResult<()> {
        self.entries.remove(&id);
        Ok(())
    }

    fn set_persistent_state(&self, id: BundleId, state: PersistentState) -> CacheResult<()> {
        self.with_entry(id, |entry| entry.archive.persistent_state = state)
    }

    fn set_start_level(&self, id: BundleId, level: u32) -> CacheResult<()> {
        self.with_entry(id, |entry| entry.archive.start_level = level)
    }

    fn data_dir(&self, _id: BundleId) -> Option<Utf8PathBuf> {
        None
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_current_revision_tracks_last_revise(
            contents in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..16), 1..8),
            undo in any::<bool>(),
        ) {
            let cache = MemoryCache::new();
            cache.create(BundleId(1), "p", 1, b"base").unwrap();

            let mut last = 0;
            for content in &contents {
                let number = cache.revise(BundleId(1), content).unwrap();
                prop_assert!(number > last);
                last = number;
            }

            let mut expected = contents.last().unwrap().clone();
            if undo {
                cache.undo_revise(BundleId(1)).unwrap();
                expected = if contents.len() > 1 {
                    contents[contents.len() - 2].clone()
                } else {
                    b"base".to_vec()
                };
            }

            let archive = cache.archive(BundleId(1)).unwrap();
            let current = archive.current_revision().unwrap().number;
            prop_assert_eq!(cache.revision(BundleId(1), current).unwrap(), expected);
        }
    }
}
