//! Resolver state: the universe of modules the solver searches over
//!
//! [`ResolverState`] owns the module graph and one [`CapabilitySet`] per
//! namespace. A module is *active* once its capabilities are indexed. Every
//! singleton symbolic name has at most one active module, and every host has
//! at most one attached revision per fragment symbolic name. Both choices
//! follow the same best-candidate order: higher version first, then lower
//! bundle id.
//!
//! All operations serialize on an internal mutex; callers additionally hold
//! the lifecycle lock of the bundles whose modules they mutate.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use graft_core::error::GraftError;
use graft_core::types::{
    BundleId, Capability, ModuleId, Namespace, Requirement, Version, BUNDLE_VERSION_ATTR,
    VERSION_ATTR,
};

use crate::capset::CapabilitySet;
use crate::graph::{Module, ModuleGraph, Wire};
use crate::ResolverResult;

/// Wires chosen for each newly resolved module
pub type WireMap = BTreeMap<ModuleId, Vec<Wire>>;

/// Best-candidate order: version descending, then bundle id ascending
pub fn best_first(a: (&Version, ModuleId), b: (&Version, ModuleId)) -> Ordering {
    b.0.cmp(a.0)
        .then_with(|| a.1.bundle.cmp(&b.1.bundle))
        .then_with(|| b.1.revision.cmp(&a.1.revision))
}

/// Candidate order applied to capabilities
pub fn candidate_order(a: &Capability, b: &Capability) -> Ordering {
    best_first((&a.version(), a.module), (&b.version(), b.module))
        .then_with(|| a.key().cmp(&b.key()))
}

/// Shared, internally synchronized resolver state
#[derive(Debug, Default)]
pub struct ResolverState {
    inner: Mutex<StateInner>,
}

#[derive(Debug)]
struct StateInner {
    graph: ModuleGraph,
    active: BTreeSet<ModuleId>,
    cap_sets: HashMap<Namespace, CapabilitySet>,
    /// Singleton symbolic name -> revisions, best first
    singletons: HashMap<String, Vec<ModuleId>>,
    /// Fragment symbolic name -> revisions, best first
    fragments: HashMap<String, Vec<ModuleId>>,
}

impl Default for StateInner {
    fn default() -> Self {
        let mut cap_sets = HashMap::new();
        cap_sets.insert(
            Namespace::Module,
            CapabilitySet::new(&[Namespace::Module.key()]),
        );
        cap_sets.insert(
            Namespace::Package,
            CapabilitySet::new(&[Namespace::Package.key(), Namespace::Module.key()]),
        );
        cap_sets.insert(Namespace::Host, CapabilitySet::new(&[Namespace::Host.key()]));

        Self {
            graph: ModuleGraph::new(),
            active: BTreeSet::new(),
            cap_sets,
            singletons: HashMap::new(),
            fragments: HashMap::new(),
        }
    }
}

impl ResolverState {
    /// Create an empty resolver state
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module and, unless it loses singleton selection, index it
    pub fn add_module(&self, module: Module) {
        self.inner.lock().add_module(module);
    }

    /// Deactivate a module and drop it from the arena
    pub fn remove_module(&self, id: ModuleId) -> Option<Module> {
        self.inner.lock().remove_module(id)
    }

    /// Candidates for `requirement` of `module`, best first
    pub fn get_candidates(
        &self,
        module: ModuleId,
        requirement: &Requirement,
        obey_mandatory: bool,
    ) -> Vec<Arc<Capability>> {
        self.inner
            .lock()
            .get_candidates(module, requirement, obey_mandatory)
    }

    /// Fail if another revision of a singleton's name is already resolved.
    ///
    /// Selection only moves to `id` when its wires are committed.
    pub fn check_singleton(&self, id: ModuleId) -> ResolverResult<()> {
        self.inner.lock().check_singleton(id)
    }

    /// Other revisions sharing a singleton module's symbolic name
    pub fn singleton_rivals(&self, id: ModuleId) -> Vec<ModuleId> {
        let inner = self.inner.lock();
        let Some(module) = inner.graph.get(id).filter(|module| module.singleton) else {
            return Vec::new();
        };
        inner
            .singletons
            .get(&module.symbolic_name)
            .into_iter()
            .flatten()
            .copied()
            .filter(|rival| *rival != id)
            .collect()
    }

    /// Detach one fragment from a host and re-index the host
    pub fn detach_fragment(&self, host: ModuleId, fragment: ModuleId) {
        let mut inner = self.inner.lock();
        let remaining: Vec<ModuleId> = match inner.graph.get(host) {
            Some(module) => module
                .fragments
                .iter()
                .copied()
                .filter(|id| *id != fragment)
                .collect(),
            None => return,
        };
        inner.remerge(host, remaining);
    }

    /// Re-index the system module after its exports changed
    pub fn refresh_system_module(&self, id: ModuleId) {
        let mut inner = self.inner.lock();
        inner.deindex_capabilities(id);
        if let Some(module) = inner.graph.get_mut(id) {
            module.aggregate.dirty = true;
        }
        if inner.active.contains(&id) {
            inner.index_capabilities(id);
        }
    }

    /// Append exports to the system module and re-index it
    pub fn extend_system_module(&self, id: ModuleId, exports: Vec<Capability>) {
        {
            let mut inner = self.inner.lock();
            inner.deindex_capabilities(id);
            if let Some(module) = inner.graph.get_mut(id) {
                module.extend_capabilities(exports);
            }
        }
        self.refresh_system_module(id);
    }

    /// Best unresolved-or-resolved host a fragment could attach to
    pub fn find_host(&self, fragment: ModuleId) -> Option<ModuleId> {
        self.inner.lock().find_host(fragment)
    }

    /// Apply a solver result: set wires and mark modules resolved.
    ///
    /// Returns every module that became resolved, including fragments
    /// attached to newly resolved hosts. Nothing is mutated on failure.
    pub fn commit(&self, wires: WireMap) -> ResolverResult<Vec<ModuleId>> {
        self.inner.lock().commit(wires)
    }

    /// Append a dynamically resolved wire to a resolved module
    pub fn add_dynamic_wire(&self, wire: Wire) -> ResolverResult<()> {
        self.inner.lock().graph.add_wire(wire)
    }

    /// Flag a revision as superseded by an update or uninstall
    pub fn mark_removal_pending(&self, id: ModuleId) {
        if let Some(module) = self.inner.lock().graph.get_mut(id) {
            module.removal_pending = true;
        }
    }

    /// Flag a revision as refreshed away
    pub fn mark_stale(&self, id: ModuleId) {
        if let Some(module) = self.inner.lock().graph.get_mut(id) {
            module.stale = true;
        }
    }

    /// Check if a module's capabilities are indexed
    pub fn is_active(&self, id: ModuleId) -> bool {
        self.inner.lock().active.contains(&id)
    }

    pub fn is_resolved(&self, id: ModuleId) -> bool {
        self.inner
            .lock()
            .graph
            .get(id)
            .map(Module::is_resolved)
            .unwrap_or(false)
    }

    /// Aggregated capabilities of a module
    pub fn capabilities(&self, id: ModuleId) -> Vec<Arc<Capability>> {
        self.inner.lock().graph.capabilities(id)
    }

    /// Aggregated static requirements of a module
    pub fn requirements(&self, id: ModuleId) -> Vec<Arc<Requirement>> {
        self.inner.lock().graph.requirements(id)
    }

    /// Aggregated dynamic requirements of a module
    pub fn dynamic_requirements(&self, id: ModuleId) -> Vec<Arc<Requirement>> {
        self.inner.lock().graph.dynamic_requirements(id)
    }

    /// Union of a module's reverse edges
    pub fn dependents(&self, id: ModuleId) -> Vec<ModuleId> {
        self.inner.lock().graph.dependents(id)
    }

    /// Bundles transitively depending on the roots, roots included
    pub fn dependent_bundle_closure(&self, roots: &[BundleId]) -> BTreeSet<BundleId> {
        self.inner.lock().graph.dependent_bundle_closure(roots)
    }

    /// Read access to the module graph
    pub fn inspect<R>(&self, f: impl FnOnce(&ModuleGraph) -> R) -> R {
        f(&self.inner.lock().graph)
    }
}

impl StateInner {
    fn add_module(&mut self, module: Module) {
        let id = module.id;
        let singleton = module.singleton;
        let name = module.symbolic_name.clone();
        self.graph.insert(module);

        if singleton {
            let selected = self.selected_singleton(&name);
            let mut list = self.singletons.remove(&name).unwrap_or_default();
            insert_ordered(&self.graph, &mut list, id);
            let best = list.first().copied();
            self.singletons.insert(name.clone(), list);

            match selected {
                Some(current) if !self.is_resolved(current) && best == Some(id) => {
                    debug!("Singleton {} displaced by {}", current, id);
                    self.deactivate(current);
                }
                Some(current) => {
                    debug!("Singleton {} kept selected over {}", current, id);
                    return;
                }
                None => {}
            }
        }
        self.activate(id);
    }

    fn remove_module(&mut self, id: ModuleId) -> Option<Module> {
        let (name, singleton, fragment) = {
            let module = self.graph.get(id)?;
            (
                module.symbolic_name.clone(),
                module.singleton,
                module.is_fragment(),
            )
        };

        self.deactivate(id);

        if singleton {
            if let Some(list) = self.singletons.get_mut(&name) {
                list.retain(|m| *m != id);
                if list.is_empty() {
                    self.singletons.remove(&name);
                }
            }
            // Promote the next best revision when the selection went away
            if self.selected_singleton(&name).is_none() {
                if let Some(next) = self.singletons.get(&name).and_then(|l| l.first()).copied() {
                    debug!("Singleton {} promoted after removal of {}", next, id);
                    self.activate(next);
                }
            }
        }
        if fragment {
            if let Some(list) = self.fragments.get_mut(&name) {
                list.retain(|m| *m != id);
                if list.is_empty() {
                    self.fragments.remove(&name);
                }
            }
        }

        if let Err(err) = self.graph.set_wires(id, None) {
            warn!("Failed to clear wires of {}: {}", id, err);
        }
        self.graph.remove(id)
    }

    fn get_candidates(
        &mut self,
        module: ModuleId,
        requirement: &Requirement,
        obey_mandatory: bool,
    ) -> Vec<Arc<Capability>> {
        let Some(cap_set) = self.cap_sets.get(&requirement.namespace) else {
            return Vec::new();
        };

        let mut candidates: Vec<Arc<Capability>> = cap_set
            .matches(&requirement.filter, obey_mandatory)
            .into_iter()
            .filter(|cap| {
                self.graph
                    .get(cap.module)
                    .map(|provider| !provider.stale)
                    .unwrap_or(false)
            })
            .filter(|cap| !self.is_substituted(cap))
            .collect();
        candidates.sort_by(|a, b| candidate_order(a, b));
        debug!(
            "{} candidate(s) for {} of {}",
            candidates.len(),
            requirement.filter,
            module
        );
        candidates
    }

    /// A resolved module that imports a package it also exports from some
    /// other provider no longer offers its own copy.
    fn is_substituted(&self, cap: &Capability) -> bool {
        if cap.namespace != Namespace::Package {
            return false;
        }
        let Some(provider) = self.graph.get(cap.module) else {
            return false;
        };
        provider.resolved
            && provider.wires.iter().any(|wire| {
                wire.namespace() == Namespace::Package
                    && wire.exporter != cap.module
                    && wire.capability.name() == cap.name()
            })
    }

    fn check_singleton(&self, id: ModuleId) -> ResolverResult<()> {
        let Some(module) = self.graph.get(id) else {
            return Err(GraftError::resolution(id, "module is not known to the resolver"));
        };
        if !module.singleton {
            return Ok(());
        }
        let name = module.symbolic_name.clone();
        let members = self.singletons.get(&name).cloned().unwrap_or_default();
        if !members.contains(&id) {
            return Ok(());
        }

        if let Some(resolved) = members
            .iter()
            .find(|m| **m != id && self.is_resolved(**m))
        {
            return Err(GraftError::resolution(
                id,
                format!("singleton {} is already resolved as {}", name, resolved),
            ));
        }
        Ok(())
    }

    /// Move singleton selection to a module about to be resolved
    fn select_singleton(&mut self, id: ModuleId) {
        let name = match self.graph.get(id) {
            Some(module) if module.singleton => module.symbolic_name.clone(),
            _ => return,
        };
        match self.selected_singleton(&name) {
            Some(current) if current == id => {}
            Some(current) => {
                debug!("Singleton selection of {} moves from {} to {}", name, current, id);
                self.deactivate(current);
                self.activate(id);
            }
            None => self.activate(id),
        }
    }

    fn find_host(&mut self, fragment: ModuleId) -> Option<ModuleId> {
        let requirement = self.graph.get(fragment)?.host_requirement.clone()?;
        let cap_set = self.cap_sets.get(&Namespace::Host)?;
        let mut hosts: Vec<Arc<Capability>> = cap_set
            .matches(&requirement.filter, false)
            .into_iter()
            .filter(|cap| {
                self.graph
                    .get(cap.module)
                    .map(|host| !host.stale && !host.removal_pending)
                    .unwrap_or(false)
            })
            .collect();
        hosts.sort_by(|a, b| candidate_order(a, b));
        hosts.first().map(|cap| cap.module)
    }

    fn commit(&mut self, wires: WireMap) -> ResolverResult<Vec<ModuleId>> {
        for (id, module_wires) in &wires {
            let module = self
                .graph
                .get(*id)
                .ok_or_else(|| GraftError::resolution(id, "module was removed during resolution"))?;
            if module.singleton {
                let clash = self
                    .singletons
                    .get(&module.symbolic_name)
                    .into_iter()
                    .flatten()
                    .find(|m| **m != *id && self.is_resolved(**m));
                if let Some(other) = clash {
                    return Err(GraftError::resolution(
                        id,
                        format!(
                            "singleton {} is already resolved as {}",
                            module.symbolic_name, other
                        ),
                    ));
                }
            }
            if let Some(missing) = module_wires
                .iter()
                .find(|wire| !self.graph.contains(wire.exporter))
            {
                return Err(GraftError::resolution(
                    id,
                    format!("exporter {} was removed during resolution", missing.exporter),
                ));
            }
        }

        let mut resolved = Vec::new();
        for (id, module_wires) in wires {
            if self.is_resolved(id) {
                continue;
            }
            self.select_singleton(id);
            self.graph.set_wires(id, Some(module_wires))?;
            let fragments = match self.graph.get_mut(id) {
                Some(module) => {
                    module.resolved = true;
                    module.fragments.clone()
                }
                None => continue,
            };
            resolved.push(id);
            for fragment in fragments {
                if let Some(fragment_module) = self.graph.get_mut(fragment) {
                    if !fragment_module.resolved {
                        fragment_module.resolved = true;
                        resolved.push(fragment);
                    }
                }
            }
        }
        Ok(resolved)
    }
}

impl StateInner {
    fn activate(&mut self, id: ModuleId) {
        let is_fragment = match self.graph.get(id) {
            Some(module) => module.is_fragment(),
            None => return,
        };
        if is_fragment {
            self.add_fragment(id);
        } else {
            self.add_host(id);
        }
    }

    fn deactivate(&mut self, id: ModuleId) {
        let is_fragment = match self.graph.get(id) {
            Some(module) => module.is_fragment(),
            None => return,
        };
        if is_fragment {
            self.remove_fragment(id);
        } else {
            self.remove_host(id);
        }
    }

    fn add_host(&mut self, host: ModuleId) {
        if !self.active.insert(host) {
            return;
        }
        let fragments = self.matching_fragments(host);
        if !fragments.is_empty() {
            self.attach_or_detach(host, fragments);
        }
        self.index_capabilities(host);
    }

    fn remove_host(&mut self, host: ModuleId) {
        if !self.active.remove(&host) {
            return;
        }
        self.deindex_capabilities(host);
        if let Err(err) = self.graph.attach_fragments(host, None) {
            warn!("Failed to detach fragments from {}: {}", host, err);
        }
    }

    fn add_fragment(&mut self, fragment: ModuleId) {
        if !self.active.insert(fragment) {
            return;
        }
        let Some(name) = self.graph.get(fragment).map(|m| m.symbolic_name.clone()) else {
            return;
        };

        let mut list = self.fragments.remove(&name).unwrap_or_default();
        insert_ordered(&self.graph, &mut list, fragment);
        let best = list.first().copied();
        self.fragments.insert(name.clone(), list);
        if best != Some(fragment) {
            debug!("Fragment {} is not the best revision of {}", fragment, name);
            return;
        }

        for host in self.matching_hosts(fragment) {
            let mut attached: Vec<ModuleId> = self
                .graph
                .get(host)
                .map(|h| h.fragments.clone())
                .unwrap_or_default()
                .into_iter()
                .filter(|id| {
                    self.graph
                        .get(*id)
                        .map(|m| m.symbolic_name != name)
                        .unwrap_or(false)
                })
                .collect();
            let at = attached.partition_point(|id| id.bundle < fragment.bundle);
            attached.insert(at, fragment);
            self.remerge(host, attached);
        }
    }

    fn remove_fragment(&mut self, fragment: ModuleId) {
        if !self.active.remove(&fragment) {
            return;
        }
        if let Some(name) = self.graph.get(fragment).map(|m| m.symbolic_name.clone()) {
            if let Some(list) = self.fragments.get_mut(&name) {
                list.retain(|m| *m != fragment);
                if list.is_empty() {
                    self.fragments.remove(&name);
                }
            }
        }

        for host in self.matching_hosts(fragment) {
            let attached = self
                .graph
                .get(host)
                .map(|h| h.fragments.contains(&fragment))
                .unwrap_or(false);
            if attached {
                let fragments = self.matching_fragments(host);
                self.remerge(host, fragments);
            }
        }
    }

    /// De-index, re-attach and re-index a host
    fn remerge(&mut self, host: ModuleId, fragments: Vec<ModuleId>) {
        let indexed = self.active.contains(&host);
        if indexed {
            self.deindex_capabilities(host);
        }
        self.attach_or_detach(host, fragments);
        if indexed {
            self.index_capabilities(host);
        }
    }

    fn attach_or_detach(&mut self, host: ModuleId, fragments: Vec<ModuleId>) {
        let fragments = self.without_conflicts(host, fragments);
        if let Err(err) = self.graph.attach_fragments(host, Some(fragments)) {
            warn!("Unable to attach fragments to {}: {}", host, err);
            if let Err(err) = self.graph.attach_fragments(host, None) {
                warn!("Unable to detach fragments from {}: {}", host, err);
            }
        }
    }

    /// Drop fragments whose requirements contradict ones already merged
    fn without_conflicts(&self, host: ModuleId, fragments: Vec<ModuleId>) -> Vec<ModuleId> {
        let mut merged: Vec<Arc<Requirement>> = self
            .graph
            .get(host)
            .map(|h| h.requirements.clone())
            .unwrap_or_default();

        let mut accepted = Vec::with_capacity(fragments.len());
        for fragment_id in fragments {
            let Some(fragment) = self.graph.get(fragment_id) else {
                accepted.push(fragment_id);
                continue;
            };
            let conflict = fragment
                .requirements
                .iter()
                .find(|req| merged.iter().any(|existing| existing.conflicts_with(req)));
            match conflict {
                Some(req) => {
                    warn!(
                        "Fragment {} not attached to {}: conflicting requirement on {}",
                        fragment_id, host, req.target
                    );
                }
                None => {
                    merged.extend(fragment.requirements.iter().cloned());
                    accepted.push(fragment_id);
                }
            }
        }
        accepted
    }

    /// Unresolved, live hosts whose host capability matches the fragment
    fn matching_hosts(&self, fragment: ModuleId) -> Vec<ModuleId> {
        let Some(requirement) = self
            .graph
            .get(fragment)
            .and_then(|m| m.host_requirement.clone())
        else {
            return Vec::new();
        };
        let Some(cap_set) = self.cap_sets.get(&Namespace::Host) else {
            return Vec::new();
        };

        let mut hosts: Vec<ModuleId> = cap_set
            .matches(&requirement.filter, false)
            .into_iter()
            .map(|cap| cap.module)
            .filter(|id| {
                self.graph
                    .get(*id)
                    .map(|host| !host.resolved && !host.stale && !host.removal_pending)
                    .unwrap_or(false)
            })
            .collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }

    /// Best live revision of each fragment name matching the host, in
    /// ascending bundle id order
    fn matching_fragments(&self, host: ModuleId) -> Vec<ModuleId> {
        let Some(host_cap) = self.graph.get(host).and_then(|m| {
            m.capabilities
                .iter()
                .find(|cap| cap.namespace == Namespace::Host)
                .cloned()
        }) else {
            return Vec::new();
        };

        let mut matching: Vec<ModuleId> = self
            .fragments
            .values()
            .filter_map(|list| {
                list.iter().copied().find(|id| {
                    self.active.contains(id)
                        && self
                            .graph
                            .get(*id)
                            .map(|m| !m.stale && !m.removal_pending)
                            .unwrap_or(false)
                })
            })
            .filter(|id| {
                self.graph
                    .get(*id)
                    .and_then(|m| m.host_requirement.as_ref())
                    .map(|req| req.matches(&host_cap))
                    .unwrap_or(false)
            })
            .collect();
        matching.sort_by_key(|id| id.bundle);
        matching
    }

    fn index_capabilities(&mut self, id: ModuleId) {
        for cap in self.graph.capabilities(id) {
            if let Some(set) = self.cap_sets.get_mut(&cap.namespace) {
                set.add_capability(cap);
            }
        }
    }

    fn deindex_capabilities(&mut self, id: ModuleId) {
        for cap in self.graph.capabilities(id) {
            if let Some(set) = self.cap_sets.get_mut(&cap.namespace) {
                set.remove_capability(&cap);
            }
        }
    }

    fn selected_singleton(&self, name: &str) -> Option<ModuleId> {
        self.singletons
            .get(name)?
            .iter()
            .copied()
            .find(|id| self.active.contains(id))
    }

    fn is_resolved(&self, id: ModuleId) -> bool {
        self.graph.get(id).map(Module::is_resolved).unwrap_or(false)
    }
}

/// Binary-search insertion in best-first order; duplicates are ignored
fn insert_ordered(graph: &ModuleGraph, list: &mut Vec<ModuleId>, id: ModuleId) {
    if list.contains(&id) {
        return;
    }
    let Some(version) = graph.get(id).map(|m| m.version.clone()) else {
        return;
    };
    let at = list.partition_point(|other| {
        graph
            .get(*other)
            .map(|m| best_first((&m.version, *other), (&version, id)) == Ordering::Less)
            .unwrap_or(true)
    });
    list.insert(at, id);
}

/// Capabilities exported by the framework itself
pub fn system_exports(
    system: ModuleId,
    framework_version: &Version,
    packages: &[(String, Version)],
) -> Vec<Capability> {
    packages
        .iter()
        .enumerate()
        .map(|(ordinal, (name, version))| {
            Capability::new(system, ordinal, Namespace::Package, name)
                .with_attribute(VERSION_ATTR, version.clone())
                .with_attribute(BUNDLE_VERSION_ATTR, framework_version.clone())
        })
        .collect()
}

#[cfg(test)]
mod tests;
