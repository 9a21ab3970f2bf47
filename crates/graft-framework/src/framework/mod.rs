//! Lifecycle orchestration
//!
//! [`Framework`] is the entry point: it owns the resolver state, the lock
//! coordinator, the bundle cache and the installed-bundle maps, and runs
//! every lifecycle operation against them. Bundle ids and the location map
//! are fields of the framework, never process globals, so several
//! frameworks can live in one process.
//!
//! Events produced while bundle locks are held are buffered and fired once
//! the locks are released.

mod lifecycle;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use graft_cache::{BundleCache, DirCache, MemoryCache};
use graft_config::toml::validate_config;
use graft_config::FrameworkConfig;
use graft_core::error::{GraftError, GraftResult};
use graft_core::types::{
    BundleId, BundleState, ModuleDescriptor, ModuleId, PersistentState, Version, SYSTEM_BUNDLE_ID,
};
use graft_resolver::{system_exports, GreedySolver, Module, ResolverState, Solver, Wire, WireMap};

use crate::activator::{Activator, ActivatorRegistry, BundleContext};
use crate::bundle::Bundle;
use crate::events::{Event, EventDispatcher, EventListener, FrameworkEventKind, ListenerId};
use crate::lock::LockCoordinator;
use crate::parser::{DescriptorParser, ManifestParser};
use crate::refresh::RefreshRequest;
use crate::services::ServiceRegistry;
use crate::start_level::StartLevelRequest;
use crate::worker::Worker;

/// Symbolic name of the system bundle
pub const SYSTEM_SYMBOLIC_NAME: &str = "graft.system";

/// Location of the system bundle
pub const SYSTEM_LOCATION: &str = "system:graft";

/// Configures and builds a [`Framework`]
pub struct FrameworkBuilder {
    config: FrameworkConfig,
    cache: Option<Arc<dyn BundleCache>>,
    parser: Option<Arc<dyn ManifestParser>>,
    solver: Option<Arc<dyn Solver>>,
    activators: ActivatorRegistry,
}

impl FrameworkBuilder {
    pub fn new(config: FrameworkConfig) -> Self {
        Self {
            config,
            cache: None,
            parser: None,
            solver: None,
            activators: ActivatorRegistry::new(),
        }
    }

    /// Use this cache instead of the one named by the configuration
    pub fn cache(mut self, cache: Arc<dyn BundleCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn parser(mut self, parser: Arc<dyn ManifestParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn solver(mut self, solver: Arc<dyn Solver>) -> Self {
        self.solver = Some(solver);
        self
    }

    /// Register an activator factory under `name`
    pub fn activator<F, A>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
        A: Activator + 'static,
    {
        self.activators.register(name, factory);
        self
    }

    pub fn activators(mut self, activators: ActivatorRegistry) -> Self {
        self.activators = activators;
        self
    }

    /// Build the framework: install the system bundle, reinstall the bundles
    /// recorded in the cache and start the worker threads.
    ///
    /// The framework stays at start level 0 until [`Framework::start`].
    pub fn build(self) -> GraftResult<Framework> {
        validate_config(&self.config)?;

        let cache: Arc<dyn BundleCache> = match self.cache {
            Some(cache) => cache,
            None => match &self.config.framework.cache_dir {
                Some(dir) => Arc::new(DirCache::open(dir)?),
                None => Arc::new(MemoryCache::new()),
            },
        };
        let events = EventDispatcher::new(self.config.framework.event_queue)?;

        let inner = Arc::new(FrameworkInner {
            cache,
            parser: self.parser.unwrap_or_else(|| Arc::new(DescriptorParser)),
            solver: self.solver.unwrap_or_else(|| Arc::new(GreedySolver::new())),
            activators: self.activators,
            resolver: ResolverState::new(),
            locks: LockCoordinator::new(),
            events,
            services: ServiceRegistry::new(),
            installed: RwLock::new(Installed::default()),
            uninstalled: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(SYSTEM_BUNDLE_ID.next().0),
            active_level: AtomicU32::new(0),
            running: AtomicBool::new(false),
            start_level_worker: OnceCell::new(),
            refresh_worker: OnceCell::new(),
            config: self.config,
        });

        inner.install_system_bundle()?;
        inner.recover_bundles();

        let weak = Arc::downgrade(&inner);
        let start_levels = Worker::spawn("graft-start-level", None, move |request| {
            if let Some(framework) = weak.upgrade() {
                framework.handle_start_level(request);
            }
        })?;
        let weak = Arc::downgrade(&inner);
        let refreshes = Worker::spawn("graft-refresh", None, move |request| {
            if let Some(framework) = weak.upgrade() {
                framework.handle_refresh(request);
            }
        })?;
        // Fresh cells, set exactly once here
        let _ = inner.start_level_worker.set(start_levels);
        let _ = inner.refresh_worker.set(refreshes);

        info!(
            "Framework built with {} bundle(s) installed",
            inner.installed.read().by_id.len()
        );
        Ok(Framework { inner })
    }
}

/// Installed bundles by location and by id
#[derive(Default)]
pub(crate) struct Installed {
    by_location: HashMap<String, Arc<Bundle>>,
    by_id: BTreeMap<BundleId, Arc<Bundle>>,
}

impl Installed {
    fn insert(&mut self, bundle: Arc<Bundle>) {
        self.by_location
            .insert(bundle.location().to_string(), Arc::clone(&bundle));
        self.by_id.insert(bundle.id(), bundle);
    }

    fn remove(&mut self, bundle: &Bundle) {
        self.by_location.remove(bundle.location());
        self.by_id.remove(&bundle.id());
    }
}

/// Shared state behind a [`Framework`] handle
pub(crate) struct FrameworkInner {
    pub(crate) config: FrameworkConfig,
    pub(crate) cache: Arc<dyn BundleCache>,
    pub(crate) parser: Arc<dyn ManifestParser>,
    pub(crate) solver: Arc<dyn Solver>,
    pub(crate) activators: ActivatorRegistry,
    pub(crate) resolver: ResolverState,
    pub(crate) locks: LockCoordinator,
    pub(crate) events: EventDispatcher,
    pub(crate) services: ServiceRegistry,
    installed: RwLock<Installed>,
    uninstalled: Mutex<Vec<Arc<Bundle>>>,
    next_id: AtomicU64,
    pub(crate) active_level: AtomicU32,
    running: AtomicBool,
    pub(crate) start_level_worker: OnceCell<Worker<StartLevelRequest>>,
    pub(crate) refresh_worker: OnceCell<Worker<RefreshRequest>>,
}

impl FrameworkInner {
    fn install_system_bundle(&self) -> GraftResult<()> {
        let version: Version = env!("CARGO_PKG_VERSION").parse()?;
        let bundle = Arc::new(Bundle::new(
            SYSTEM_BUNDLE_ID,
            SYSTEM_LOCATION,
            0,
            PersistentState::Active,
        ));

        let module_id = bundle.next_module_id();
        let descriptor = ModuleDescriptor::new(SYSTEM_SYMBOLIC_NAME, version.clone());
        self.resolver
            .add_module(Module::from_descriptor(module_id, &descriptor));
        let exports = system_exports(module_id, &version, &self.config.system_package_list());
        if !exports.is_empty() {
            self.resolver.extend_system_module(module_id, exports);
        }
        self.resolver
            .commit(WireMap::from([(module_id, Vec::new())]))?;

        bundle.push_module(module_id, descriptor);
        bundle.set_state(BundleState::Active);
        self.installed.write().insert(bundle);
        Ok(())
    }

    /// Reinstall the bundles recorded in the cache under their old ids
    fn recover_bundles(&self) {
        let mut highest = SYSTEM_BUNDLE_ID;
        for archive in self.cache.archives() {
            highest = highest.max(archive.id);
            if archive.id.is_system() {
                continue;
            }
            if archive.persistent_state == PersistentState::Uninstalled {
                if let Err(err) = self.cache.remove(archive.id) {
                    warn!("Failed to remove uninstalled bundle {}: {}", archive.id, err);
                }
                continue;
            }
            if archive.revisions.len() > 1 {
                if let Err(err) = self.cache.purge(archive.id) {
                    warn!("Failed to purge old revisions of bundle {}: {}", archive.id, err);
                }
            }

            let Some(current) = archive.current_revision() else {
                warn!("Bundle {} has no stored revision; skipping", archive.id);
                continue;
            };
            let recovered = self
                .cache
                .revision(archive.id, current.number)
                .and_then(|content| {
                    self.create_bundle(
                        archive.id,
                        &archive.location,
                        archive.start_level,
                        archive.persistent_state,
                        &content,
                    )
                });
            match recovered {
                Ok(bundle) => {
                    info!("Recovered bundle {}", bundle);
                    self.installed.write().insert(bundle);
                }
                Err(err) => warn!(
                    "Skipping bundle {} from {}: {}",
                    archive.id, archive.location, err
                ),
            }
        }
        self.next_id.store(highest.next().0, Ordering::Release);
    }

    /// Parse content and register a bundle's first module revision
    pub(crate) fn create_bundle(
        &self,
        id: BundleId,
        location: &str,
        start_level: u32,
        persistent_state: PersistentState,
        content: &[u8],
    ) -> GraftResult<Arc<Bundle>> {
        let descriptor = self.parser.parse(location, content)?;
        let bundle = Arc::new(Bundle::new(id, location, start_level, persistent_state));
        let module_id = bundle.next_module_id();
        self.resolver
            .add_module(Module::from_descriptor(module_id, &descriptor));
        bundle.push_module(module_id, descriptor);
        Ok(bundle)
    }

    pub(crate) fn allocate_id(&self) -> BundleId {
        BundleId(self.next_id.fetch_add(1, Ordering::AcqRel))
    }

    /// Installed or uninstalled-but-not-refreshed bundle
    pub(crate) fn lookup(&self, id: BundleId) -> Option<Arc<Bundle>> {
        if let Some(bundle) = self.installed.read().by_id.get(&id) {
            return Some(Arc::clone(bundle));
        }
        self.uninstalled
            .lock()
            .iter()
            .find(|bundle| bundle.id() == id)
            .cloned()
    }

    pub(crate) fn bundle(&self, id: BundleId) -> GraftResult<Arc<Bundle>> {
        self.lookup(id)
            .ok_or(GraftError::BundleNotFound { bundle: id })
    }

    pub(crate) fn bundle_by_location(&self, location: &str) -> Option<Arc<Bundle>> {
        self.installed.read().by_location.get(location).cloned()
    }

    /// Installed bundles by ascending id
    pub(crate) fn bundles(&self) -> Vec<Arc<Bundle>> {
        self.installed.read().by_id.values().cloned().collect()
    }

    pub(crate) fn register_installed(&self, bundle: Arc<Bundle>) {
        self.installed.write().insert(bundle);
    }

    /// Move a bundle from the installed maps to the pending-refresh list
    pub(crate) fn move_to_uninstalled(&self, bundle: &Arc<Bundle>) {
        self.installed.write().remove(bundle);
        let mut uninstalled = self.uninstalled.lock();
        if !uninstalled.iter().any(|b| b.id() == bundle.id()) {
            uninstalled.push(Arc::clone(bundle));
        }
    }

    pub(crate) fn forget_uninstalled(&self, id: BundleId) {
        self.uninstalled.lock().retain(|bundle| bundle.id() != id);
    }

    pub(crate) fn uninstalled_ids(&self) -> Vec<BundleId> {
        self.uninstalled.lock().iter().map(|bundle| bundle.id()).collect()
    }

    /// Check if a module of another bundle depends on any revision of `bundle`
    pub(crate) fn is_used(&self, bundle: &Bundle) -> bool {
        bundle.modules().into_iter().any(|module| {
            self.resolver
                .dependents(module)
                .iter()
                .any(|dependent| dependent.bundle != bundle.id())
        })
    }

    pub(crate) fn context(self: &Arc<Self>, bundle: BundleId) -> BundleContext {
        BundleContext::new(bundle, Arc::downgrade(self))
    }

    pub(crate) fn active_level(&self) -> u32 {
        self.active_level.load(Ordering::Acquire)
    }

    pub(crate) fn fire_all(&self, events: Vec<Event>) {
        self.events.fire_all(events);
    }

    /// Log an error and queue it for firing once locks are released
    pub(crate) fn report(&self, bundle: BundleId, err: &GraftError, events: &mut Vec<Event>) {
        error!("Bundle {}: {}", bundle, err);
        events.push(Event::error(bundle, err.to_string()));
    }

    /// Log an error and publish it as a framework error event
    pub(crate) fn broadcast(&self, bundle: BundleId, err: &GraftError) {
        error!("Bundle {}: {}", bundle, err);
        self.events.fire(Event::error(bundle, err.to_string()));
    }
}

/// Handle on a running framework; clones share the same framework
#[derive(Clone)]
pub struct Framework {
    inner: Arc<FrameworkInner>,
}

impl Framework {
    /// Build a framework with default collaborators
    pub fn new(config: FrameworkConfig) -> GraftResult<Self> {
        FrameworkBuilder::new(config).build()
    }

    pub fn builder(config: FrameworkConfig) -> FrameworkBuilder {
        FrameworkBuilder::new(config)
    }

    /// Raise the start level to the configured beginning level and wait for
    /// the bundles it covers to start
    pub fn start(&self) -> GraftResult<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let level = self.inner.config.framework.begin_start_level;
        self.inner.set_level_and_wait(level)?;
        self.inner
            .events
            .fire(Event::framework(FrameworkEventKind::Started, SYSTEM_BUNDLE_ID));
        info!("Framework started at level {}", level);
        Ok(())
    }

    /// Stop every bundle by lowering the start level to 0, then stop the
    /// workers and the event dispatcher and interrupt lock waiters
    pub fn shutdown(&self) -> GraftResult<()> {
        if self.inner.locks.is_interrupted() {
            return Ok(());
        }
        self.inner.running.store(false, Ordering::Release);
        self.inner.set_level_and_wait(0)?;

        if let Some(worker) = self.inner.refresh_worker.get() {
            worker.stop();
        }
        if let Some(worker) = self.inner.start_level_worker.get() {
            worker.stop();
        }
        self.inner
            .events
            .fire(Event::framework(FrameworkEventKind::Stopped, SYSTEM_BUNDLE_ID));
        self.inner.events.shutdown();
        self.inner.locks.interrupt();
        info!("Framework stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Install the bundle at `location`, or return the bundle already
    /// installed there
    pub fn install(&self, location: &str, content: &[u8]) -> GraftResult<Arc<Bundle>> {
        self.inner.install(location, content)
    }

    pub fn resolve(&self, bundle: BundleId) -> GraftResult<()> {
        self.inner.resolve(bundle)
    }

    /// Resolve the given bundles, or every INSTALLED bundle; true if all
    /// of them resolved
    pub fn resolve_bundles(&self, targets: Option<&[BundleId]>) -> GraftResult<bool> {
        self.inner.resolve_bundles(targets)
    }

    pub fn start_bundle(&self, bundle: BundleId, persist: bool) -> GraftResult<()> {
        self.inner.start_bundle(bundle, persist)
    }

    pub fn stop_bundle(&self, bundle: BundleId, persist: bool) -> GraftResult<()> {
        self.inner.stop_bundle(bundle, persist)
    }

    /// Store new content for a bundle, or reload its current content
    pub fn update(&self, bundle: BundleId, content: Option<&[u8]>) -> GraftResult<()> {
        self.inner.update(bundle, content)
    }

    pub fn uninstall(&self, bundle: BundleId) -> GraftResult<()> {
        self.inner.uninstall(bundle)
    }

    /// Refresh the given bundles, or every uninstalled or updated bundle,
    /// together with everything depending on them
    pub fn refresh_packages(&self, targets: Option<&[BundleId]>) -> GraftResult<()> {
        self.inner.refresh_packages(targets.map(<[BundleId]>::to_vec))
    }

    /// Queue a refresh on the refresh worker
    pub fn refresh_packages_async(&self, targets: Option<Vec<BundleId>>) -> bool {
        self.inner.submit_refresh(targets, None)
    }

    /// Wire a package a resolved bundle loads dynamically
    pub fn resolve_dynamic_import(&self, bundle: BundleId, package: &str) -> GraftResult<Option<Wire>> {
        self.inner.resolve_dynamic_import(bundle, package)
    }

    /// Queue a change of the framework's active start level
    pub fn set_framework_start_level(&self, level: u32) -> GraftResult<()> {
        self.inner.set_framework_start_level(level)
    }

    pub fn set_bundle_start_level(&self, bundle: BundleId, level: u32) -> GraftResult<()> {
        self.inner.set_bundle_start_level(bundle, level)
    }

    /// Active start level
    pub fn start_level(&self) -> u32 {
        self.inner.active_level()
    }

    /// Start level given to newly installed bundles
    pub fn initial_bundle_start_level(&self) -> u32 {
        self.inner.config.framework.initial_bundle_start_level
    }

    pub fn bundle(&self, id: BundleId) -> Option<Arc<Bundle>> {
        self.inner.lookup(id)
    }

    pub fn bundle_by_location(&self, location: &str) -> Option<Arc<Bundle>> {
        self.inner.bundle_by_location(location)
    }

    /// Installed bundles by ascending id, the system bundle included
    pub fn bundles(&self) -> Vec<Arc<Bundle>> {
        self.inner.bundles()
    }

    /// Wires of one module revision
    pub fn wires(&self, module: ModuleId) -> Vec<Wire> {
        self.inner.resolver.inspect(|graph| {
            graph
                .get(module)
                .map(|m| m.wires().to_vec())
                .unwrap_or_default()
        })
    }

    pub fn resolver(&self) -> &ResolverState {
        &self.inner.resolver
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.inner.services
    }

    /// Context of the system bundle, for code embedding the framework
    pub fn system_context(&self) -> BundleContext {
        self.inner.context(SYSTEM_BUNDLE_ID)
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        self.inner.events.add_listener(SYSTEM_BUNDLE_ID, listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.events.remove_listener(id)
    }

    /// Number of listeners a bundle has registered
    pub fn listener_count(&self, bundle: BundleId) -> usize {
        self.inner.events.listener_count(bundle)
    }

    /// Wait until every event fired so far has been delivered
    pub fn flush_events(&self) {
        self.inner.events.flush();
    }
}

impl std::fmt::Debug for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framework")
            .field("start_level", &self.start_level())
            .field("bundles", &self.inner.installed.read().by_id.len())
            .finish()
    }
}

#[cfg(test)]
mod tests;
