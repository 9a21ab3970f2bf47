//! Install, resolve, start, stop, update and uninstall.
//!
//! Every operation takes the bundle's lock for its whole duration. The
//! `*_locked` variants assume the caller holds it and append the events
//! they produce to a buffer the caller fires after releasing the lock.
//!
//! Resolving commits wires and resolved flags for every module the solver
//! pulls in, so it also needs the locks of the bundles owning those modules
//! and of the singleton revisions it displaces. Operations that may resolve
//! take that whole set up front through [`LockCoordinator::lock_all`]; a
//! resolve nested in a batch that already holds locks only tries to take the
//! rest and fails with `LockContended` rather than wait while holding locks.
//!
//! [`LockCoordinator::lock_all`]: crate::lock::LockCoordinator::lock_all

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use graft_core::error::{GraftError, GraftResult};
use graft_core::types::{BundleId, BundleState, ModuleId, Namespace, PersistentState};
use graft_resolver::{Module, Wire, WireMap};

use super::FrameworkInner;
use crate::activator::buffered;
use crate::bundle::Bundle;
use crate::events::{BundleEventKind, Event, ServiceEventKind};

impl FrameworkInner {
    pub(crate) fn install(&self, location: &str, content: &[u8]) -> GraftResult<Arc<Bundle>> {
        if let Some(existing) = self.bundle_by_location(location) {
            return Ok(existing);
        }

        let reservation = self.locks.lock_location(location)?;
        // Another caller may have finished installing while we waited
        if let Some(existing) = self.bundle_by_location(location) {
            return Ok(existing);
        }

        let id = self.allocate_id();
        let level = self.config.framework.initial_bundle_start_level;
        self.cache.create(id, location, level, content)?;
        let bundle = match self.create_bundle(id, location, level, PersistentState::Installed, content)
        {
            Ok(bundle) => bundle,
            Err(err) => {
                if let Err(cleanup) = self.cache.remove(id) {
                    warn!("Failed to remove archive of bundle {}: {}", id, cleanup);
                }
                return Err(err);
            }
        };
        self.register_installed(Arc::clone(&bundle));
        drop(reservation);

        info!("Installed {} from {}", bundle, location);
        self.events
            .fire(Event::bundle(BundleEventKind::Installed, id));
        Ok(bundle)
    }

    pub(crate) fn resolve(&self, id: BundleId) -> GraftResult<()> {
        let bundle = self.bundle(id)?;
        let (result, events) = self.with_wiring_locks(id, |events| {
            events.extend(self.resolve_locked(&bundle)?);
            Ok(())
        });
        self.fire_all(events);
        match &result {
            Err(GraftError::LockInterrupted { .. }) | Ok(()) => {}
            Err(err) => self.broadcast(id, err),
        }
        result
    }

    /// Run `op` holding the locks of `id` and of every bundle resolving it
    /// would touch, starting over when the wiring moved to a bundle that was
    /// not part of the locked set.
    pub(crate) fn with_wiring_locks<T>(
        &self,
        id: BundleId,
        op: impl FnMut(&mut Vec<Event>) -> GraftResult<T>,
    ) -> (GraftResult<T>, Vec<Event>) {
        self.with_locks(|| self.wiring_targets(id), op)
    }

    fn with_locks<T>(
        &self,
        mut targets: impl FnMut() -> BTreeSet<BundleId>,
        mut op: impl FnMut(&mut Vec<Event>) -> GraftResult<T>,
    ) -> (GraftResult<T>, Vec<Event>) {
        loop {
            let batch = match self.locks.lock_all(&mut targets) {
                Ok(batch) => batch,
                Err(err) => return (Err(err), Vec::new()),
            };
            let mut events = Vec::new();
            let result = op(&mut events);
            drop(batch);
            match result {
                Err(GraftError::LockContended { bundle }) => {
                    debug!("Bundle {} is busy, taking the lock set again", bundle);
                }
                result => return (result, events),
            }
        }
    }

    /// The bundle plus, while it is INSTALLED, every bundle its resolution
    /// would currently touch
    pub(crate) fn wiring_targets(&self, id: BundleId) -> BTreeSet<BundleId> {
        let mut targets = BTreeSet::from([id]);
        let Some(bundle) = self.lookup(id) else {
            return targets;
        };
        if bundle.state() != BundleState::Installed {
            return targets;
        }
        if let Some(module) = bundle.current_module() {
            if let Ok(wires) = self.solver.resolve(&self.resolver, module) {
                targets.extend(self.wire_owners(&wires));
            }
        }
        targets
    }

    /// Bundles whose modules a commit of `wires` mutates or depends on
    fn wire_owners(&self, wires: &WireMap) -> BTreeSet<BundleId> {
        let mut owners = BTreeSet::new();
        for (module, module_wires) in wires {
            owners.insert(module.bundle);
            owners.extend(module_wires.iter().map(|wire| wire.exporter.bundle));
            owners.extend(
                self.resolver
                    .singleton_rivals(*module)
                    .into_iter()
                    .map(|rival| rival.bundle),
            );
            let fragments = self.resolver.inspect(|graph| {
                graph
                    .get(*module)
                    .map(|m| m.fragments().to_vec())
                    .unwrap_or_default()
            });
            owners.extend(fragments.into_iter().map(|fragment| fragment.bundle));
        }
        // The system module never changes once the framework is built
        owners.retain(|id| !id.is_system());
        owners
    }

    pub(crate) fn resolve_bundles(&self, targets: Option<&[BundleId]>) -> GraftResult<bool> {
        let batch = self.locks.lock_all(|| {
            self.resolvable(targets)
                .into_iter()
                .flat_map(|id| self.wiring_targets(id))
                .collect()
        })?;
        let resolvable = self.resolvable(targets);

        let mut events = Vec::new();
        let mut failures = Vec::new();
        let mut contended = Vec::new();
        for id in &resolvable {
            let Some(bundle) = self.lookup(*id) else {
                continue;
            };
            if bundle.state() != BundleState::Installed {
                continue;
            }
            match self.resolve_locked(&bundle) {
                Ok(resolved) => events.extend(resolved),
                Err(GraftError::LockContended { .. }) => contended.push(bundle),
                Err(err) => failures.push((*id, err)),
            }
        }
        drop(batch);

        // Wiring that moved outside the batch is retried with its own locks
        for bundle in contended {
            let (result, resolved) = self.with_wiring_locks(bundle.id(), |events| {
                events.extend(self.resolve_locked(&bundle)?);
                Ok(())
            });
            events.extend(resolved);
            if let Err(err) = result {
                failures.push((bundle.id(), err));
            }
        }

        self.fire_all(events);
        for (id, err) in &failures {
            self.broadcast(*id, err);
        }
        Ok(failures.is_empty())
    }

    /// INSTALLED bundles among `targets`, or all of them
    fn resolvable(&self, targets: Option<&[BundleId]>) -> BTreeSet<BundleId> {
        let candidates: Vec<Arc<Bundle>> = match targets {
            Some(ids) => ids.iter().filter_map(|id| self.lookup(*id)).collect(),
            None => self.bundles(),
        };
        candidates
            .into_iter()
            .filter(|bundle| bundle.state() == BundleState::Installed)
            .map(|bundle| bundle.id())
            .collect()
    }

    /// Resolve the bundle's current revision and everything it pulls in.
    ///
    /// The locks of every bundle the wires touch are taken without waiting
    /// before anything is committed; `LockContended` names one that is held
    /// elsewhere. Other bundles resolved along the way move from INSTALLED to
    /// RESOLVED.
    pub(crate) fn resolve_locked(&self, bundle: &Bundle) -> GraftResult<Vec<Event>> {
        match bundle.state() {
            BundleState::Installed => {}
            BundleState::Uninstalled => {
                return Err(GraftError::state(bundle.id(), BundleState::Uninstalled, "resolve"))
            }
            _ => return Ok(Vec::new()),
        }

        let module = current_module(bundle)?;
        let wires = self.solver.resolve(&self.resolver, module)?;
        let owners = self.wire_owners(&wires);
        let _wired = self.locks.try_lock_all(owners.clone())?;

        // Solve again now that nothing the wires touch can change
        let wires = self.solver.resolve(&self.resolver, module)?;
        if let Some(outside) = self.wire_owners(&wires).difference(&owners).next() {
            return Err(GraftError::LockContended { bundle: *outside });
        }
        let resolved = self.resolver.commit(wires)?;

        let mut events = Vec::new();
        for id in resolved {
            let Some(owner) = self.lookup(id.bundle) else {
                continue;
            };
            if owner.current_module() == Some(id)
                && owner.compare_and_set(BundleState::Installed, BundleState::Resolved)
            {
                events.push(Event::bundle(BundleEventKind::Resolved, owner.id()));
            }
        }
        debug!("Resolved {}", bundle);
        Ok(events)
    }

    pub(crate) fn start_bundle(self: &Arc<Self>, id: BundleId, persist: bool) -> GraftResult<()> {
        let bundle = self.bundle(id)?;
        let (result, events) =
            self.with_wiring_locks(id, |events| self.start_locked(&bundle, persist, events));
        self.fire_all(events);
        if let Err(err) = &result {
            if matches!(
                err,
                GraftError::Activation { .. } | GraftError::ResolutionConflict { .. }
            ) {
                self.broadcast(id, err);
            }
        }
        result
    }

    pub(crate) fn start_locked(
        self: &Arc<Self>,
        bundle: &Bundle,
        persist: bool,
        events: &mut Vec<Event>,
    ) -> GraftResult<()> {
        let id = bundle.id();
        match bundle.state() {
            BundleState::Active => return Ok(()),
            state @ (BundleState::Uninstalled | BundleState::Starting | BundleState::Stopping) => {
                return Err(GraftError::state(id, state, "start"))
            }
            BundleState::Installed | BundleState::Resolved => {}
        }
        if bundle.descriptor().is_fragment() {
            return Err(GraftError::state(id, bundle.state(), "start fragment"));
        }

        if persist {
            self.cache.set_persistent_state(id, PersistentState::Active)?;
            bundle.set_persistent_state(PersistentState::Active);
        }
        if bundle.persistent_state() != PersistentState::Active {
            debug!("Bundle {} is not persistently active, not starting", id);
            return Ok(());
        }
        if bundle.start_level() > self.active_level() {
            debug!(
                "Bundle {} waits for start level {} (active {})",
                id,
                bundle.start_level(),
                self.active_level()
            );
            return Ok(());
        }

        if bundle.state() == BundleState::Installed {
            events.extend(self.resolve_locked(bundle)?);
        }

        bundle.set_state(BundleState::Starting);
        events.push(Event::bundle(BundleEventKind::Starting, id));

        let context = self.context(id);
        let outcome = match bundle.descriptor().activator.as_deref() {
            None => Ok(None),
            Some(name) => match self.activators.create(name) {
                None => Err(GraftError::activation(
                    id,
                    format!("no activator registered as '{}'", name),
                )),
                Some(mut activator) => buffered(events, || activator.start(&context))
                    .map(|_| Some(activator))
                    .map_err(|e| GraftError::activation(id, e)),
            },
        };

        match outcome {
            Ok(activator) => {
                bundle.set_activator(activator);
                bundle.set_state(BundleState::Active);
                events.push(Event::bundle(BundleEventKind::Started, id));
                info!("Started {}", bundle);
                Ok(())
            }
            Err(err) => {
                bundle.set_state(BundleState::Stopping);
                events.push(Event::bundle(BundleEventKind::Stopping, id));
                events.extend(self.release_resources(id));
                bundle.set_state(BundleState::Resolved);
                events.push(Event::bundle(BundleEventKind::Stopped, id));
                Err(err)
            }
        }
    }

    pub(crate) fn stop_bundle(self: &Arc<Self>, id: BundleId, persist: bool) -> GraftResult<()> {
        let bundle = self.bundle(id)?;
        let mut events = Vec::new();
        let result = match self.locks.acquire(id) {
            Ok(_guard) => self.stop_locked(&bundle, persist, &mut events),
            Err(err) => Err(err),
        };
        self.fire_all(events);
        if let Err(err @ GraftError::Activation { .. }) = &result {
            self.broadcast(id, err);
        }
        result
    }

    /// Stop an active bundle.
    ///
    /// Services and listeners are released and the bundle is RESOLVED on
    /// return, whether or not its activator's stop hook failed.
    pub(crate) fn stop_locked(
        self: &Arc<Self>,
        bundle: &Bundle,
        persist: bool,
        events: &mut Vec<Event>,
    ) -> GraftResult<()> {
        let id = bundle.id();
        if id.is_system() {
            return Err(GraftError::state(id, bundle.state(), "stop"));
        }
        let state = bundle.state();
        match state {
            BundleState::Uninstalled | BundleState::Starting | BundleState::Stopping => {
                return Err(GraftError::state(id, state, "stop"))
            }
            _ => {}
        }

        if persist {
            self.cache
                .set_persistent_state(id, PersistentState::Installed)?;
            bundle.set_persistent_state(PersistentState::Installed);
        }
        if state != BundleState::Active {
            return Ok(());
        }

        bundle.set_state(BundleState::Stopping);
        events.push(Event::bundle(BundleEventKind::Stopping, id));

        let context = self.context(id);
        let result = match bundle.take_activator() {
            Some(mut activator) => buffered(events, || activator.stop(&context))
                .map_err(|e| GraftError::activation(id, e)),
            None => Ok(()),
        };

        events.extend(self.release_resources(id));
        bundle.set_state(BundleState::Resolved);
        events.push(Event::bundle(BundleEventKind::Stopped, id));
        info!("Stopped {}", bundle);
        result
    }

    /// Unregister a bundle's services, drop the services it holds and
    /// remove its listeners
    fn release_resources(&self, id: BundleId) -> Vec<Event> {
        let events: Vec<Event> = self
            .services
            .unregister_services(id)
            .into_iter()
            .map(|reference| {
                Event::service(ServiceEventKind::Unregistering, reference.id, reference.bundle)
            })
            .collect();
        let released = self.services.unget_services(id);
        let listeners = self.events.remove_listeners(id);
        debug!(
            "Bundle {}: {} service(s) unregistered, {} released, {} listener(s) removed",
            id,
            events.len(),
            released,
            listeners
        );
        events
    }

    pub(crate) fn update(self: &Arc<Self>, id: BundleId, content: Option<&[u8]>) -> GraftResult<()> {
        let bundle = self.bundle(id)?;
        let mut events = Vec::new();
        let result = match self.locks.acquire(id) {
            Ok(_guard) => self.update_locked(&bundle, content, &mut events),
            Err(err) => Err(err),
        };
        self.fire_all(events);

        // The new revision has to resolve before it restarts, which takes
        // the locks of the bundles it wires to
        if let Ok(true) = result {
            let (restarted, events) =
                self.with_wiring_locks(id, |events| self.start_locked(&bundle, false, events));
            self.fire_all(events);
            if let Err(err) = restarted {
                self.broadcast(id, &err);
            }
        }
        result.map(|_| ())
    }

    /// Replace the bundle's revision, returning whether it was active and
    /// should be restarted
    fn update_locked(
        self: &Arc<Self>,
        bundle: &Bundle,
        content: Option<&[u8]>,
        events: &mut Vec<Event>,
    ) -> GraftResult<bool> {
        let id = bundle.id();
        let state = bundle.state();
        if id.is_system()
            || matches!(
                state,
                BundleState::Uninstalled | BundleState::Starting | BundleState::Stopping
            )
        {
            return Err(GraftError::state(id, state, "update"));
        }

        let was_active = state == BundleState::Active;
        if was_active {
            if let Err(err) = self.stop_locked(bundle, false, events) {
                self.report(id, &err, events);
            }
        }

        let content = match content {
            Some(content) => content.to_vec(),
            None => {
                let archive = self
                    .cache
                    .archive(id)
                    .ok_or(GraftError::BundleNotFound { bundle: id })?;
                let current = archive
                    .current_revision()
                    .map(|revision| revision.number)
                    .unwrap_or_default();
                self.cache.revision(id, current)?
            }
        };

        let revised = self
            .cache
            .revise(id, &content)
            .and_then(|_| match self.parser.parse(bundle.location(), &content) {
                Ok(descriptor) => Ok(descriptor),
                Err(err) => {
                    if let Err(undo) = self.cache.undo_revise(id) {
                        warn!("Failed to roll back revision of bundle {}: {}", id, undo);
                    }
                    Err(err)
                }
            });
        let descriptor = match revised {
            Ok(descriptor) => descriptor,
            Err(err) => {
                if was_active {
                    if let Err(restart) = self.start_locked(bundle, false, events) {
                        self.report(id, &restart, events);
                    }
                }
                return Err(err);
            }
        };

        let outgoing = bundle.current_module();
        let module_id = bundle.next_module_id();
        self.resolver
            .add_module(Module::from_descriptor(module_id, &descriptor));
        bundle.push_module(module_id, descriptor);
        if let Some(outgoing) = outgoing {
            self.resolver.mark_removal_pending(outgoing);
        }

        bundle.set_state(BundleState::Installed);
        if state.is_resolved() {
            events.push(Event::bundle(BundleEventKind::Unresolved, id));
        }
        events.push(Event::bundle(BundleEventKind::Updated, id));
        info!("Updated {} to module {}", bundle, module_id);

        if self.config.framework.purge_unused && !self.is_used(bundle) {
            self.purge_old_revisions(bundle);
        }
        Ok(was_active)
    }

    /// Drop every revision but the current one from the resolver and cache
    fn purge_old_revisions(&self, bundle: &Bundle) {
        let removed = bundle.retain_current_module();
        for module in &removed {
            self.resolver.mark_stale(*module);
            self.resolver.remove_module(*module);
        }
        if let Err(err) = self.cache.purge(bundle.id()) {
            warn!("Failed to purge old revisions of bundle {}: {}", bundle.id(), err);
        }
        debug!("Purged {} unused revision(s) of bundle {}", removed.len(), bundle.id());
    }

    /// Uninstall a bundle.
    ///
    /// Only an illegal state is reported to the caller; failures along the
    /// way are broadcast and the uninstall goes on.
    pub(crate) fn uninstall(self: &Arc<Self>, id: BundleId) -> GraftResult<()> {
        let bundle = self.bundle(id)?;
        let mut events = Vec::new();
        let result = match self.locks.acquire(id) {
            Ok(_guard) => self.uninstall_locked(&bundle, &mut events),
            Err(err) => Err(err),
        };
        self.fire_all(events);
        result
    }

    fn uninstall_locked(self: &Arc<Self>, bundle: &Arc<Bundle>, events: &mut Vec<Event>) -> GraftResult<()> {
        let id = bundle.id();
        let state = bundle.state();
        if id.is_system()
            || matches!(
                state,
                BundleState::Uninstalled | BundleState::Starting | BundleState::Stopping
            )
        {
            return Err(GraftError::state(id, state, "uninstall"));
        }

        if state == BundleState::Active {
            if let Err(err) = self.stop_locked(bundle, false, events) {
                self.report(id, &err, events);
            }
        }

        if let Err(err) = self
            .cache
            .set_persistent_state(id, PersistentState::Uninstalled)
        {
            self.report(id, &err, events);
        }
        bundle.set_persistent_state(PersistentState::Uninstalled);

        self.move_to_uninstalled(bundle);
        if let Some(module) = bundle.current_module() {
            self.resolver.mark_removal_pending(module);
        }

        let was_resolved = bundle.state().is_resolved();
        bundle.set_state(BundleState::Uninstalled);
        if was_resolved {
            events.push(Event::bundle(BundleEventKind::Unresolved, id));
        }
        events.push(Event::bundle(BundleEventKind::Uninstalled, id));
        info!("Uninstalled {}", bundle);

        if self.config.framework.purge_unused && !self.is_used(bundle) {
            self.remove_bundle(bundle);
        }
        Ok(())
    }

    /// Physically remove an uninstalled bundle: modules, archive and the
    /// pending-refresh entry
    pub(crate) fn remove_bundle(&self, bundle: &Bundle) {
        for module in bundle.take_modules() {
            self.resolver.mark_stale(module);
            self.resolver.remove_module(module);
        }
        bundle.mark_stale();
        if let Err(err) = self.cache.remove(bundle.id()) {
            warn!("Failed to remove archive of bundle {}: {}", bundle.id(), err);
        }
        self.forget_uninstalled(bundle.id());
        debug!("Removed bundle {}", bundle.id());
    }

    pub(crate) fn resolve_dynamic_import(&self, id: BundleId, package: &str) -> GraftResult<Option<Wire>> {
        let bundle = self.bundle(id)?;
        let targets = || {
            let mut targets = BTreeSet::from([id]);
            if let Some(module) = bundle.current_module() {
                if let Ok(Some(wire)) = self.solver.resolve_dynamic(&self.resolver, module, package) {
                    if !wire.exporter.bundle.is_system() {
                        targets.insert(wire.exporter.bundle);
                    }
                }
            }
            targets
        };
        let (result, _) = self.with_locks(targets, |_| self.dynamic_import_locked(&bundle, package));
        result
    }

    fn dynamic_import_locked(&self, bundle: &Bundle, package: &str) -> GraftResult<Option<Wire>> {
        let id = bundle.id();
        let module = current_module(bundle)?;
        if !self.resolver.is_resolved(module) {
            return Err(GraftError::state(id, bundle.state(), "dynamically import into"));
        }

        let existing = self.resolver.inspect(|graph| {
            graph.get(module).and_then(|m| {
                m.wires()
                    .iter()
                    .find(|wire| {
                        wire.namespace() == Namespace::Package && wire.capability.name() == package
                    })
                    .cloned()
            })
        });
        if existing.is_some() {
            return Ok(existing);
        }

        let wire = self.solver.resolve_dynamic(&self.resolver, module, package)?;
        if let Some(wire) = &wire {
            let exporter = wire.exporter.bundle;
            if !exporter.is_system() && !self.locks.is_held_by_current_thread(exporter) {
                return Err(GraftError::LockContended { bundle: exporter });
            }
            self.resolver.add_dynamic_wire(wire.clone())?;
            debug!("Dynamically wired {}", wire);
        }
        Ok(wire)
    }
}

fn current_module(bundle: &Bundle) -> GraftResult<ModuleId> {
    bundle
        .current_module()
        .ok_or_else(|| GraftError::resolution(bundle.id(), "bundle has no module revision"))
}
