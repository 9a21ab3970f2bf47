//! Package refresh
//!
//! Refreshing drops superseded module revisions and physically removes
//! uninstalled bundles. Everything that transitively depends on the
//! refreshed bundles is stopped, re-created from its current revision and
//! then brought back to the state it had before.

use std::collections::BTreeSet;
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{debug, error, info, warn};

use graft_core::error::{GraftError, GraftResult};
use graft_core::types::{BundleId, BundleState, SYSTEM_BUNDLE_ID};
use graft_resolver::Module;

use crate::bundle::Bundle;
use crate::events::{BundleEventKind, Event, FrameworkEventKind};
use crate::framework::FrameworkInner;

/// Queued refresh; `targets` of `None` means every pending bundle
pub(crate) struct RefreshRequest {
    pub(crate) targets: Option<Vec<BundleId>>,
    pub(crate) ack: Option<Sender<()>>,
}

impl FrameworkInner {
    pub(crate) fn submit_refresh(
        &self,
        targets: Option<Vec<BundleId>>,
        ack: Option<Sender<()>>,
    ) -> bool {
        self.refresh_worker
            .get()
            .map(|worker| worker.submit(RefreshRequest { targets, ack }))
            .unwrap_or(false)
    }

    pub(crate) fn handle_refresh(self: &Arc<Self>, request: RefreshRequest) {
        if let Err(err) = self.refresh_packages(request.targets) {
            self.broadcast(SYSTEM_BUNDLE_ID, &err);
        }
        if let Some(ack) = request.ack {
            let _ = ack.send(());
        }
    }

    pub(crate) fn refresh_packages(self: &Arc<Self>, targets: Option<Vec<BundleId>>) -> GraftResult<()> {
        let roots = targets.unwrap_or_else(|| self.pending_refresh());
        if roots.is_empty() {
            self.events.fire(Event::framework(
                FrameworkEventKind::PackagesRefreshed,
                SYSTEM_BUNDLE_ID,
            ));
            return Ok(());
        }

        let batch = self.locks.lock_all(|| self.refresh_closure(&roots))?;
        let closure: Vec<Arc<Bundle>> = batch
            .bundles()
            .iter()
            .filter_map(|id| self.lookup(*id))
            .collect();
        debug!(
            "Refreshing {} bundle(s) for root(s) {:?}",
            closure.len(),
            roots
        );

        let mut events = Vec::new();
        let mut failures = Vec::new();

        let mut previously_active: Vec<Arc<Bundle>> = closure
            .iter()
            .filter(|bundle| bundle.state() == BundleState::Active)
            .cloned()
            .collect();
        let previously_resolved: BTreeSet<BundleId> = closure
            .iter()
            .filter(|bundle| bundle.state().is_resolved())
            .map(|bundle| bundle.id())
            .collect();

        for bundle in closure.iter().rev() {
            if bundle.state() == BundleState::Active {
                if let Err(err) = self.stop_locked(bundle, false, &mut events) {
                    failures.push((bundle.id(), err));
                }
            }
        }

        for bundle in &closure {
            if bundle.state() == BundleState::Uninstalled {
                self.remove_bundle(bundle);
            } else if let Err(err) = self.reinitialize(bundle, &mut events) {
                failures.push((bundle.id(), err));
            }
        }

        // Bundles whose wiring reaches a bundle locked outside the closure
        // are finished once the closure is released
        let mut contended = Vec::new();
        for bundle in &closure {
            if previously_resolved.contains(&bundle.id()) && bundle.state() == BundleState::Installed {
                match self.resolve_locked(bundle) {
                    Ok(resolved) => events.extend(resolved),
                    Err(GraftError::LockContended { .. }) => contended.push(Arc::clone(bundle)),
                    Err(err) => failures.push((bundle.id(), err)),
                }
            }
        }

        previously_active.sort_by_key(|bundle| (bundle.start_level(), bundle.id()));
        let mut restarts = Vec::new();
        for bundle in &previously_active {
            if bundle.state() == BundleState::Uninstalled {
                continue;
            }
            match self.start_locked(bundle, false, &mut events) {
                Ok(()) => {}
                Err(GraftError::LockContended { .. }) => restarts.push(Arc::clone(bundle)),
                Err(err) => failures.push((bundle.id(), err)),
            }
        }
        drop(batch);

        for bundle in &contended {
            let (result, resolved) = self.with_wiring_locks(bundle.id(), |events| {
                events.extend(self.resolve_locked(bundle)?);
                Ok(())
            });
            events.extend(resolved);
            if let Err(err) = result {
                failures.push((bundle.id(), err));
            }
        }
        for bundle in &restarts {
            let (result, started) = self
                .with_wiring_locks(bundle.id(), |events| self.start_locked(bundle, false, events));
            events.extend(started);
            if let Err(err) = result {
                failures.push((bundle.id(), err));
            }
        }

        self.fire_all(events);
        for (id, err) in &failures {
            self.broadcast(*id, err);
        }
        self.events.fire(Event::framework(
            FrameworkEventKind::PackagesRefreshed,
            SYSTEM_BUNDLE_ID,
        ));
        info!("Refreshed {} bundle(s)", closure.len());
        Ok(())
    }

    /// Uninstalled bundles plus bundles holding more than one revision
    fn pending_refresh(&self) -> Vec<BundleId> {
        let mut roots = self.uninstalled_ids();
        roots.extend(
            self.bundles()
                .into_iter()
                .filter(|bundle| bundle.modules().len() > 1)
                .map(|bundle| bundle.id()),
        );
        roots
    }

    /// Roots plus every bundle transitively depending on them
    fn refresh_closure(&self, roots: &[BundleId]) -> BTreeSet<BundleId> {
        let mut closure = self.resolver.dependent_bundle_closure(roots);
        closure.extend(roots.iter().copied());
        closure.retain(|id| !id.is_system() && self.lookup(*id).is_some());
        closure
    }

    /// Replace all of a bundle's modules with one fresh module built from
    /// its current stored revision
    fn reinitialize(&self, bundle: &Bundle, events: &mut Vec<Event>) -> GraftResult<()> {
        let id = bundle.id();
        let was_resolved = bundle.state().is_resolved();
        for module in bundle.take_modules() {
            self.resolver.mark_stale(module);
            self.resolver.remove_module(module);
        }
        if let Err(err) = self.cache.purge(id) {
            warn!("Failed to purge old revisions of bundle {}: {}", id, err);
        }

        bundle.set_state(BundleState::Installed);
        if was_resolved {
            events.push(Event::bundle(BundleEventKind::Unresolved, id));
        }

        let archive = self
            .cache
            .archive(id)
            .ok_or(GraftError::BundleNotFound { bundle: id })?;
        let current = archive
            .current_revision()
            .map(|revision| revision.number)
            .unwrap_or_default();
        let content = self.cache.revision(id, current)?;
        let descriptor = self.parser.parse(bundle.location(), &content).map_err(|err| {
            error!("Bundle {} has no usable revision after refresh", id);
            err
        })?;

        let module_id = bundle.next_module_id();
        self.resolver
            .add_module(Module::from_descriptor(module_id, &descriptor));
        bundle.push_module(module_id, descriptor);
        Ok(())
    }
}
