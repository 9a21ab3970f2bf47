//! Module graph: the arena of module revisions, their wires and reverse edges
//!
//! Wires point from an importer to an exporter. Every exporter keeps reverse
//! edges to the modules wired to it (dependent hosts, importers and
//! requirers, by namespace), which seed the dependent closure computed
//! during refresh.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;
use tracing::debug;

use graft_core::error::GraftError;
use graft_core::types::{BundleId, Capability, ModuleId, Namespace, Requirement};

use crate::ResolverResult;

pub mod module;

pub use module::{Module, Wire};

/// Arena of modules keyed by id
#[derive(Debug, Default)]
pub struct ModuleGraph {
    modules: HashMap<ModuleId, Module>,
}

impl ModuleGraph {
    /// Create a new empty module graph
    pub fn new() -> Self {
        Self {
            modules: HashMap::new(),
        }
    }

    /// Insert a module; an existing module with the same id is replaced
    pub fn insert(&mut self, module: Module) {
        self.modules.insert(module.id, module);
    }

    /// Remove a module from the arena
    pub fn remove(&mut self, id: ModuleId) -> Option<Module> {
        self.modules.remove(&id)
    }

    pub fn get(&self, id: ModuleId) -> Option<&Module> {
        self.modules.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ModuleId) -> Option<&mut Module> {
        self.modules.get_mut(&id)
    }

    pub fn contains(&self, id: ModuleId) -> bool {
        self.modules.contains_key(&id)
    }

    /// Number of modules in the arena
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// All modules, in no particular order
    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    /// Revisions of one bundle in ascending revision order
    pub fn modules_of(&self, bundle: BundleId) -> Vec<ModuleId> {
        let mut ids: Vec<ModuleId> = self
            .modules
            .keys()
            .filter(|id| id.bundle == bundle)
            .copied()
            .collect();
        ids.sort();
        ids
    }

    fn require(&self, id: ModuleId) -> ResolverResult<&Module> {
        self.modules
            .get(&id)
            .ok_or_else(|| GraftError::resolution(id, "module is not known to the resolver"))
    }
}

impl ModuleGraph {
    /// Replace a module's wires, keeping reverse edges consistent.
    ///
    /// Old reverse edges are removed before the list is swapped and new ones
    /// added after, so no exporter ever keeps an edge to a module that no
    /// longer wires to it.
    pub fn set_wires(&mut self, id: ModuleId, wires: Option<Vec<Wire>>) -> ResolverResult<()> {
        self.require(id)?;

        let old: Vec<(ModuleId, Namespace)> = self.modules[&id]
            .wires
            .iter()
            .map(|wire| (wire.exporter, wire.namespace()))
            .collect();
        for (exporter, namespace) in old {
            if let Some(exporter) = self.modules.get_mut(&exporter) {
                exporter.remove_dependent(namespace, id);
            }
        }

        let wires = wires.unwrap_or_default();
        let new: Vec<(ModuleId, Namespace)> = wires
            .iter()
            .map(|wire| (wire.exporter, wire.namespace()))
            .collect();
        if let Some(module) = self.modules.get_mut(&id) {
            module.wires = wires;
        }

        for (exporter, namespace) in new {
            match self.modules.get_mut(&exporter) {
                Some(exporter) => exporter.add_dependent(namespace, id),
                None => debug!("Wire from {} targets unknown exporter {}", id, exporter),
            }
        }
        Ok(())
    }

    /// Append one wire, used for dynamic imports
    pub fn add_wire(&mut self, wire: Wire) -> ResolverResult<()> {
        let importer = wire.importer;
        let (exporter, namespace) = (wire.exporter, wire.namespace());
        self.require(importer)?;

        if let Some(module) = self.modules.get_mut(&importer) {
            module.wires.push(wire);
        }
        if let Some(exporter) = self.modules.get_mut(&exporter) {
            exporter.add_dependent(namespace, importer);
        }
        Ok(())
    }

    /// Attach fragments to a host, replacing any previously attached ones.
    ///
    /// Dependent-host edges are moved from the old fragments to the new ones
    /// and the host's aggregated views are invalidated. Fails if a fragment
    /// is unknown or is not a fragment; the host is then left partially
    /// attached and the caller is expected to detach everything.
    pub fn attach_fragments(
        &mut self,
        host: ModuleId,
        fragments: Option<Vec<ModuleId>>,
    ) -> ResolverResult<()> {
        let previous = std::mem::take(
            &mut self
                .modules
                .get_mut(&host)
                .ok_or_else(|| GraftError::resolution(host, "host is not known to the resolver"))?
                .fragments,
        );
        for fragment in previous {
            if let Some(fragment) = self.modules.get_mut(&fragment) {
                fragment.remove_dependent(Namespace::Host, host);
            }
        }
        if let Some(module) = self.modules.get_mut(&host) {
            module.aggregate.dirty = true;
        }

        for fragment_id in fragments.unwrap_or_default() {
            let fragment = self.modules.get_mut(&fragment_id).ok_or_else(|| {
                GraftError::resolution(fragment_id, "fragment is not known to the resolver")
            })?;
            if !fragment.is_fragment() {
                return Err(GraftError::resolution(
                    fragment_id,
                    format!("{} is not a fragment", fragment.symbolic_name),
                ));
            }
            fragment.add_dependent(Namespace::Host, host);
            if let Some(module) = self.modules.get_mut(&host) {
                module.fragments.push(fragment_id);
            }
        }
        Ok(())
    }

    /// Union of a module's reverse edges
    pub fn dependents(&self, id: ModuleId) -> Vec<ModuleId> {
        self.modules
            .get(&id)
            .map(Module::dependents)
            .unwrap_or_default()
    }

    /// Bundles that transitively depend on any revision of the roots.
    ///
    /// Edges run from an exporter to each of its dependents, and between
    /// revisions of the same bundle, so a dependent of an old revision pulls
    /// in every other revision of its bundle as well. The roots are always
    /// part of the result.
    pub fn dependent_bundle_closure(&self, roots: &[BundleId]) -> BTreeSet<BundleId> {
        let mut graph: DiGraphMap<ModuleId, ()> = DiGraphMap::new();
        let mut by_bundle: HashMap<BundleId, Vec<ModuleId>> = HashMap::new();

        for module in self.modules.values() {
            graph.add_node(module.id);
            by_bundle.entry(module.id.bundle).or_default().push(module.id);
            for dependent in module.dependents() {
                graph.add_edge(module.id, dependent, ());
            }
        }
        for revisions in by_bundle.values() {
            for pair in revisions.windows(2) {
                graph.add_edge(pair[0], pair[1], ());
                graph.add_edge(pair[1], pair[0], ());
            }
        }

        let mut closure: BTreeSet<BundleId> = roots.iter().copied().collect();
        for root in roots {
            for start in by_bundle.get(root).into_iter().flatten() {
                let mut dfs = Dfs::new(&graph, *start);
                while let Some(reached) = dfs.next(&graph) {
                    closure.insert(reached.bundle);
                }
            }
        }
        closure
    }
}

impl ModuleGraph {
    /// Capabilities of a module merged with its fragments' package and
    /// module capabilities
    pub fn capabilities(&mut self, id: ModuleId) -> Vec<Arc<Capability>> {
        self.refresh_aggregate(id);
        self.modules
            .get(&id)
            .map(|m| m.aggregate.capabilities.clone())
            .unwrap_or_default()
    }

    /// Static requirements of a module merged with its fragments'
    pub fn requirements(&mut self, id: ModuleId) -> Vec<Arc<Requirement>> {
        self.refresh_aggregate(id);
        self.modules
            .get(&id)
            .map(|m| m.aggregate.requirements.clone())
            .unwrap_or_default()
    }

    /// Dynamic requirements of a module merged with its fragments'
    pub fn dynamic_requirements(&mut self, id: ModuleId) -> Vec<Arc<Requirement>> {
        self.refresh_aggregate(id);
        self.modules
            .get(&id)
            .map(|m| m.aggregate.dynamic_requirements.clone())
            .unwrap_or_default()
    }

    fn refresh_aggregate(&mut self, id: ModuleId) {
        let Some(module) = self.modules.get(&id) else {
            return;
        };
        if !module.aggregate.dirty {
            return;
        }

        let mut capabilities = module.capabilities.clone();
        let mut requirements = module.requirements.clone();
        let mut dynamic_requirements = module.dynamic_requirements.clone();

        for fragment_id in &module.fragments {
            let Some(fragment) = self.modules.get(fragment_id) else {
                continue;
            };
            capabilities.extend(
                fragment
                    .capabilities
                    .iter()
                    .filter(|cap| matches!(cap.namespace, Namespace::Package | Namespace::Module))
                    .map(|cap| Arc::new(cap.contributed_to(id))),
            );
            requirements.extend(
                fragment
                    .requirements
                    .iter()
                    .filter(|req| matches!(req.namespace, Namespace::Package | Namespace::Module))
                    .map(|req| Arc::new(req.contributed_to(id))),
            );
            dynamic_requirements.extend(
                fragment
                    .dynamic_requirements
                    .iter()
                    .filter(|req| req.namespace == Namespace::Package)
                    .map(|req| Arc::new(req.contributed_to(id))),
            );
        }

        if let Some(module) = self.modules.get_mut(&id) {
            module.aggregate.capabilities = capabilities;
            module.aggregate.requirements = requirements;
            module.aggregate.dynamic_requirements = dynamic_requirements;
            module.aggregate.dirty = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graft_core::types::{ModuleDescriptor, Version, VersionRange};

    fn id(bundle: u64) -> ModuleId {
        ModuleId::new(BundleId(bundle), 0)
    }

    fn module(graph: &mut ModuleGraph, bundle: u64, descriptor: ModuleDescriptor) -> ModuleId {
        let id = id(bundle);
        graph.insert(Module::from_descriptor(id, &descriptor));
        id
    }

    fn package_wire(graph: &mut ModuleGraph, importer: ModuleId, exporter: ModuleId) -> Wire {
        let requirement = graph.requirements(importer)[0].clone();
        let capability = graph
            .capabilities(exporter)
            .into_iter()
            .find(|cap| cap.namespace == Namespace::Package)
            .unwrap();
        Wire::new(importer, requirement, capability)
    }

    #[test]
    fn test_set_wires_maintains_reverse_edges() {
        let mut graph = ModuleGraph::new();
        let a = module(&mut graph, 1, ModuleDescriptor::new("a", Version::new(1, 0, 0)).export("p", Version::new(1, 0, 0)));
        let b = module(&mut graph, 2, ModuleDescriptor::new("b", Version::new(1, 0, 0)).import("p", VersionRange::any()));

        let wire = package_wire(&mut graph, b, a);
        graph.set_wires(b, Some(vec![wire])).unwrap();
        assert_eq!(graph.get(a).unwrap().dependent_importers(), &[b]);
        assert_eq!(graph.dependents(a), vec![b]);

        graph.set_wires(b, None).unwrap();
        assert!(graph.get(a).unwrap().dependent_importers().is_empty());
        assert!(graph.get(b).unwrap().wires().is_empty());
    }

    #[test]
    fn test_rewiring_moves_reverse_edge() {
        let mut graph = ModuleGraph::new();
        let a1 = module(&mut graph, 1, ModuleDescriptor::new("a1", Version::new(1, 0, 0)).export("p", Version::new(1, 0, 0)));
        let a2 = module(&mut graph, 2, ModuleDescriptor::new("a2", Version::new(1, 0, 0)).export("p", Version::new(2, 0, 0)));
        let b = module(&mut graph, 3, ModuleDescriptor::new("b", Version::new(1, 0, 0)).import("p", VersionRange::any()));

        let first = package_wire(&mut graph, b, a1);
        graph.set_wires(b, Some(vec![first])).unwrap();
        let second = package_wire(&mut graph, b, a2);
        graph.set_wires(b, Some(vec![second])).unwrap();

        assert!(graph.dependents(a1).is_empty());
        assert_eq!(graph.dependents(a2), vec![b]);
    }

    #[test]
    fn test_attach_fragments_merges_views() {
        let mut graph = ModuleGraph::new();
        let host = module(&mut graph, 1, ModuleDescriptor::new("h", Version::new(1, 0, 0)).export("p", Version::new(1, 0, 0)));
        let fragment = module(
            &mut graph,
            2,
            ModuleDescriptor::new("f", Version::new(1, 0, 0))
                .fragment_of("h", VersionRange::any())
                .export("p.impl", Version::new(1, 0, 0))
                .import("q", VersionRange::any()),
        );

        assert_eq!(graph.capabilities(host).len(), 3);
        graph.attach_fragments(host, Some(vec![fragment])).unwrap();

        let caps = graph.capabilities(host);
        assert_eq!(caps.len(), 4);
        let contributed = caps.iter().find(|cap| cap.name() == "p.impl").unwrap();
        assert_eq!(contributed.module, host);
        assert_eq!(contributed.declared_by, fragment);
        assert_eq!(graph.requirements(host).len(), 1);
        assert_eq!(graph.get(fragment).unwrap().dependent_hosts(), &[host]);

        graph.attach_fragments(host, None).unwrap();
        assert_eq!(graph.capabilities(host).len(), 3);
        assert!(graph.get(fragment).unwrap().dependent_hosts().is_empty());
    }

    #[test]
    fn test_attach_rejects_non_fragment() {
        let mut graph = ModuleGraph::new();
        let host = module(&mut graph, 1, ModuleDescriptor::new("h", Version::new(1, 0, 0)));
        let other = module(&mut graph, 2, ModuleDescriptor::new("x", Version::new(1, 0, 0)));
        assert!(graph.attach_fragments(host, Some(vec![other])).is_err());
        assert!(graph.attach_fragments(id(9), None).is_err());
    }

    #[test]
    fn test_dependent_bundle_closure_follows_revisions() {
        let mut graph = ModuleGraph::new();
        let a = module(&mut graph, 1, ModuleDescriptor::new("a", Version::new(1, 0, 0)).export("p", Version::new(1, 0, 0)));
        let b = module(&mut graph, 2, ModuleDescriptor::new("b", Version::new(1, 0, 0)).import("p", VersionRange::any()).export("q", Version::new(1, 0, 0)));
        let c = module(&mut graph, 3, ModuleDescriptor::new("c", Version::new(1, 0, 0)).import("q", VersionRange::any()));
        module(&mut graph, 4, ModuleDescriptor::new("d", Version::new(1, 0, 0)));

        let b_wire = package_wire(&mut graph, b, a);
        graph.set_wires(b, Some(vec![b_wire])).unwrap();
        let c_wire = package_wire(&mut graph, c, b);
        graph.set_wires(c, Some(vec![c_wire])).unwrap();

        // A newer revision of bundle 1 pulls in dependents of the older one
        let a_next = ModuleId::new(BundleId(1), 1);
        graph.insert(Module::from_descriptor(
            a_next,
            &ModuleDescriptor::new("a", Version::new(2, 0, 0)),
        ));

        let closure = graph.dependent_bundle_closure(&[BundleId(1)]);
        assert_eq!(
            closure.into_iter().collect::<Vec<_>>(),
            vec![BundleId(1), BundleId(2), BundleId(3)]
        );

        let leaf = graph.dependent_bundle_closure(&[BundleId(3)]);
        assert_eq!(leaf.len(), 1);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use graft_core::types::{ModuleDescriptor, Version, VersionRange};
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn clearing_wires_leaves_no_reverse_edges(
            exporters in 1usize..6,
            picks in prop::collection::vec(0usize..6, 1..6),
        ) {
            let mut graph = ModuleGraph::new();
            let mut exporter_ids = Vec::new();
            for n in 0..exporters {
                let id = ModuleId::new(BundleId(n as u64 + 1), 0);
                graph.insert(Module::from_descriptor(
                    id,
                    &ModuleDescriptor::new(format!("e{}", n), Version::new(1, 0, 0))
                        .export("p", Version::new(n as u64, 0, 0)),
                ));
                exporter_ids.push(id);
            }
            let importer = ModuleId::new(BundleId(100), 0);
            graph.insert(Module::from_descriptor(
                importer,
                &ModuleDescriptor::new("i", Version::new(1, 0, 0)).import("p", VersionRange::any()),
            ));

            let requirement = graph.requirements(importer)[0].clone();
            let wires: Vec<Wire> = picks
                .iter()
                .map(|pick| exporter_ids[pick % exporters])
                .map(|exporter| {
                    let cap = graph
                        .capabilities(exporter)
                        .into_iter()
                        .find(|cap| cap.namespace == Namespace::Package)
                        .unwrap();
                    Wire::new(importer, requirement.clone(), cap)
                })
                .collect();

            graph.set_wires(importer, Some(wires)).unwrap();
            graph.set_wires(importer, None).unwrap();

            for exporter in &exporter_ids {
                prop_assert!(!graph.dependents(*exporter).contains(&importer));
            }
        }
    }
}
