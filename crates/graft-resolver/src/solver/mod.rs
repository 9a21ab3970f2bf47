//! Wiring solver
//!
//! The [`Solver`] trait turns a root module into the wires of every module
//! that has to resolve with it. [`GreedySolver`] is a depth-first search over
//! the candidates the resolver state offers, in best-first order, backing
//! out of subtrees that fail. It performs no package-space consistency
//! checks.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, trace};

use graft_core::error::GraftError;
use graft_core::types::{AttributeValue, ModuleId, Namespace, Requirement};

use crate::graph::Wire;
use crate::state::{ResolverState, WireMap};
use crate::ResolverResult;

/// Computes wires for unresolved modules
pub trait Solver: Send + Sync {
    /// Wires for `root` and every unresolved module it pulls in.
    ///
    /// Either every needed module gets its wires or an error is returned;
    /// the state is never mutated.
    fn resolve(&self, state: &ResolverState, root: ModuleId) -> ResolverResult<WireMap>;

    /// A wire for a package loaded dynamically by a resolved module, if any
    /// dynamic requirement of the module admits it
    fn resolve_dynamic(
        &self,
        state: &ResolverState,
        importer: ModuleId,
        package: &str,
    ) -> ResolverResult<Option<Wire>>;
}

/// Depth-first backtracking solver
#[derive(Debug, Default, Clone, Copy)]
pub struct GreedySolver;

impl GreedySolver {
    pub fn new() -> Self {
        Self
    }
}

impl Solver for GreedySolver {
    fn resolve(&self, state: &ResolverState, root: ModuleId) -> ResolverResult<WireMap> {
        let root = match state.inspect(|graph| graph.get(root).map(|m| m.is_fragment())) {
            None => return Err(GraftError::resolution(root, "module is not known to the resolver")),
            Some(false) => root,
            Some(true) => {
                let host = state.find_host(root).ok_or_else(|| {
                    GraftError::resolution(root, "no host matches the fragment")
                })?;
                if state.is_resolved(host) {
                    return Err(GraftError::resolution(
                        root,
                        format!("host {} is already resolved", host),
                    ));
                }
                debug!("Resolving fragment {} through host {}", root, host);
                host
            }
        };

        if state.is_resolved(root) {
            return Ok(WireMap::new());
        }
        state.check_singleton(root)?;

        let mut session = Session {
            state,
            wires: WireMap::new(),
            in_progress: BTreeSet::new(),
        };
        session.resolve_module(root)?;
        debug!("Resolved {} with {} module(s)", root, session.wires.len());
        Ok(session.wires)
    }

    fn resolve_dynamic(
        &self,
        state: &ResolverState,
        importer: ModuleId,
        package: &str,
    ) -> ResolverResult<Option<Wire>> {
        if !state.is_resolved(importer) {
            return Err(GraftError::resolution(
                importer,
                "dynamic imports need a resolved module",
            ));
        }

        let already_wired = state.inspect(|graph| {
            graph.get(importer).map(|m| {
                m.wires()
                    .iter()
                    .any(|w| w.namespace() == Namespace::Package && w.capability.name() == package)
            })
        });
        if already_wired.unwrap_or(true) {
            return Ok(None);
        }
        let exports_itself = state
            .capabilities(importer)
            .iter()
            .any(|cap| cap.namespace == Namespace::Package && cap.name() == package);
        if exports_itself {
            return Ok(None);
        }

        for dynamic in state.dynamic_requirements(importer) {
            if !admits(&dynamic, package) {
                continue;
            }
            let concrete = Arc::new(Requirement {
                declared_by: dynamic.declared_by,
                ..Requirement::new(
                    importer,
                    dynamic.ordinal,
                    Namespace::Package,
                    package,
                    dynamic.range.clone(),
                )
                .dynamic()
            });

            let provider = state
                .get_candidates(importer, &concrete, true)
                .into_iter()
                .find(|cap| cap.module != importer && state.is_resolved(cap.module));
            if let Some(capability) = provider {
                debug!("Dynamic import of {} by {} from {}", package, importer, capability.module);
                return Ok(Some(Wire::new(importer, concrete, capability)));
            }
        }
        Ok(None)
    }
}

/// Check if a dynamic import pattern covers a package name
fn admits(dynamic: &Requirement, package: &str) -> bool {
    if dynamic.target == "*" {
        return true;
    }
    let pieces: Vec<String> = dynamic.target.split('*').map(str::to_string).collect();
    AttributeValue::from(package).matches_substring(&pieces)
}

struct Session<'a> {
    state: &'a ResolverState,
    wires: WireMap,
    /// Modules on the current search path; treated as resolvable
    in_progress: BTreeSet<ModuleId>,
}

impl Session<'_> {
    fn resolve_module(&mut self, id: ModuleId) -> ResolverResult<()> {
        if self.state.is_resolved(id)
            || self.wires.contains_key(&id)
            || self.in_progress.contains(&id)
        {
            return Ok(());
        }

        self.in_progress.insert(id);
        let result = self.wire_requirements(id);
        self.in_progress.remove(&id);

        let wires = result?;
        self.wires.insert(id, wires);
        Ok(())
    }

    fn wire_requirements(&mut self, id: ModuleId) -> ResolverResult<Vec<Wire>> {
        let mut wires = Vec::new();

        for requirement in self.state.requirements(id) {
            let candidates = self.state.get_candidates(id, &requirement, true);
            let mut chosen = None;
            let mut nested_error = None;

            for capability in candidates {
                if capability.module == id {
                    chosen = Some(capability);
                    break;
                }

                let snapshot = self.wires.clone();
                match self.resolve_module(capability.module) {
                    Ok(()) => {
                        chosen = Some(capability);
                        break;
                    }
                    Err(err) => {
                        trace!("Candidate {} rejected for {}: {}", capability, id, err);
                        self.wires = snapshot;
                        nested_error.get_or_insert(err);
                    }
                }
            }

            match chosen {
                Some(capability) => wires.push(Wire::new(id, requirement, capability)),
                None if requirement.optional => {
                    debug!("Optional requirement {} of {} left unwired", requirement.filter, id);
                }
                None => {
                    return Err(nested_error.unwrap_or_else(|| {
                        GraftError::resolution(
                            id,
                            format!(
                                "missing {} requirement {}",
                                requirement.namespace, requirement.filter
                            ),
                        )
                    }));
                }
            }
        }
        Ok(wires)
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::graph::Module;
    use graft_core::types::{BundleId, ModuleDescriptor, Version, VersionRange};
    use proptest::prelude::*;

    proptest! {
        /// Every mandatory requirement of a resolved module gets exactly one
        /// wire, and a failed resolve touches nothing
        #[test]
        fn wires_match_requirements(
            exports in prop::collection::vec(prop::option::of("[p-s]"), 1..8),
            imports in prop::collection::vec(prop::collection::vec("[p-t]", 0..3), 1..8),
        ) {
            let state = ResolverState::new();
            let count = exports.len().min(imports.len());
            for bundle in 0..count {
                let mut descriptor = ModuleDescriptor::new(format!("m{bundle}"), Version::new(1, 0, 0));
                if let Some(package) = &exports[bundle] {
                    descriptor = descriptor.export(package, Version::new(1, 0, 0));
                }
                let mut seen = Vec::new();
                for package in &imports[bundle] {
                    if !seen.contains(package) {
                        descriptor = descriptor.import(package, VersionRange::any());
                        seen.push(package.clone());
                    }
                }
                state.add_module(Module::from_descriptor(
                    ModuleId::new(BundleId(bundle as u64 + 1), 0),
                    &descriptor,
                ));
            }

            let root = ModuleId::new(BundleId(1), 0);
            match GreedySolver.resolve(&state, root) {
                Ok(wires) => {
                    for (id, module_wires) in &wires {
                        let requirements = state.requirements(*id);
                        prop_assert_eq!(module_wires.len(), requirements.len());
                        for wire in module_wires {
                            prop_assert!(wire.requirement.matches(&wire.capability));
                        }
                    }
                }
                Err(_) => {
                    prop_assert!(!state.is_resolved(root));
                }
            }
        }
    }
}
