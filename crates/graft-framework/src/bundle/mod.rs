//! Installed bundles
//!
//! A [`Bundle`] is the framework's record of one installed location: its
//! live lifecycle state, the persistent state mirrored from the cache, its
//! start level and the ids of its module revisions, oldest first. Modules
//! themselves live in the resolver's arena and are looked up by id.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use graft_core::types::{BundleId, BundleState, ModuleDescriptor, ModuleId, PersistentState, Version};

use crate::activator::Activator;

/// One installed bundle
pub struct Bundle {
    id: BundleId,
    location: String,
    state: Mutex<BundleState>,
    persistent_state: Mutex<PersistentState>,
    start_level: AtomicU32,
    modules: Mutex<Vec<ModuleId>>,
    next_revision: AtomicU32,
    descriptor: Mutex<ModuleDescriptor>,
    stale: AtomicBool,
    last_modified: Mutex<DateTime<Utc>>,
    activator: Mutex<Option<Box<dyn Activator>>>,
}

impl Bundle {
    pub(crate) fn new(
        id: BundleId,
        location: impl Into<String>,
        start_level: u32,
        persistent_state: PersistentState,
    ) -> Self {
        Self {
            id,
            location: location.into(),
            state: Mutex::new(BundleState::Installed),
            persistent_state: Mutex::new(persistent_state),
            start_level: AtomicU32::new(start_level),
            modules: Mutex::new(Vec::new()),
            next_revision: AtomicU32::new(0),
            descriptor: Mutex::new(ModuleDescriptor::new("", Version::zero())),
            stale: AtomicBool::new(false),
            last_modified: Mutex::new(Utc::now()),
            activator: Mutex::new(None),
        }
    }

    pub fn id(&self) -> BundleId {
        self.id
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Live lifecycle state
    pub fn state(&self) -> BundleState {
        *self.state.lock()
    }

    /// State that survives a restart
    pub fn persistent_state(&self) -> PersistentState {
        *self.persistent_state.lock()
    }

    pub fn start_level(&self) -> u32 {
        self.start_level.load(Ordering::Acquire)
    }

    /// Symbolic name of the current revision
    pub fn symbolic_name(&self) -> String {
        self.descriptor.lock().symbolic_name.clone()
    }

    /// Version of the current revision
    pub fn version(&self) -> Version {
        self.descriptor.lock().version.clone()
    }

    /// Descriptor of the current revision
    pub fn descriptor(&self) -> ModuleDescriptor {
        self.descriptor.lock().clone()
    }

    /// Newest module revision
    pub fn current_module(&self) -> Option<ModuleId> {
        self.modules.lock().last().copied()
    }

    /// Every module revision, oldest first
    pub fn modules(&self) -> Vec<ModuleId> {
        self.modules.lock().clone()
    }

    /// Check if the bundle was refreshed away while someone held on to it
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        *self.last_modified.lock()
    }

    pub(crate) fn set_state(&self, state: BundleState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("Bundle {}: {} -> {}", self.id, *current, state);
            *current = state;
        }
    }

    /// Move to `to` only if the bundle is still in `from`
    pub(crate) fn compare_and_set(&self, from: BundleState, to: BundleState) -> bool {
        let mut current = self.state.lock();
        if *current != from {
            return false;
        }
        debug!("Bundle {}: {} -> {}", self.id, from, to);
        *current = to;
        true
    }

    pub(crate) fn set_persistent_state(&self, state: PersistentState) {
        *self.persistent_state.lock() = state;
    }

    pub(crate) fn set_start_level(&self, level: u32) {
        self.start_level.store(level, Ordering::Release);
    }

    /// Allocate the id of the next module revision
    pub(crate) fn next_module_id(&self) -> ModuleId {
        ModuleId::new(self.id, self.next_revision.fetch_add(1, Ordering::AcqRel))
    }

    /// Append a revision and make its descriptor current
    pub(crate) fn push_module(&self, id: ModuleId, descriptor: ModuleDescriptor) {
        self.modules.lock().push(id);
        *self.descriptor.lock() = descriptor;
        self.touch();
    }

    /// Drop every revision but the newest, returning the dropped ones
    pub(crate) fn retain_current_module(&self) -> Vec<ModuleId> {
        let mut modules = self.modules.lock();
        let keep = modules.len().saturating_sub(1);
        modules.drain(..keep).collect()
    }

    /// Take every module id, leaving the bundle without revisions
    pub(crate) fn take_modules(&self) -> Vec<ModuleId> {
        std::mem::take(&mut *self.modules.lock())
    }

    pub(crate) fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub(crate) fn touch(&self) {
        *self.last_modified.lock() = Utc::now();
    }

    pub(crate) fn set_activator(&self, activator: Option<Box<dyn Activator>>) {
        *self.activator.lock() = activator;
    }

    pub(crate) fn take_activator(&self) -> Option<Box<dyn Activator>> {
        self.activator.lock().take()
    }
}

impl fmt::Debug for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bundle")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("state", &self.state())
            .field("start_level", &self.start_level())
            .field("modules", &self.modules())
            .finish()
    }
}

impl fmt::Display for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let descriptor = self.descriptor.lock();
        if descriptor.symbolic_name.is_empty() {
            write!(f, "{} [{}]", self.location, self.id)
        } else {
            write!(f, "{} {} [{}]", descriptor.symbolic_name, descriptor.version, self.id)
        }
    }
}
