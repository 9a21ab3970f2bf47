//! Module revisions and wires.

use std::fmt;
use std::sync::Arc;

use graft_core::types::{
    Capability, Declarations, ModuleDescriptor, ModuleId, Namespace, Requirement, Version,
};

/// Concrete binding of one requirement to one capability
#[derive(Debug, Clone)]
pub struct Wire {
    /// Requirement the wire satisfies
    pub requirement: Arc<Requirement>,
    /// Capability chosen for it
    pub capability: Arc<Capability>,
    /// Module holding the requirement
    pub importer: ModuleId,
    /// Module providing the capability
    pub exporter: ModuleId,
}

impl Wire {
    /// Create a wire from `importer` to the capability's provider
    pub fn new(importer: ModuleId, requirement: Arc<Requirement>, capability: Arc<Capability>) -> Self {
        Self {
            exporter: capability.module,
            requirement,
            capability,
            importer,
        }
    }

    /// Namespace of the wired capability
    pub fn namespace(&self) -> Namespace {
        self.capability.namespace
    }
}

impl PartialEq for Wire {
    fn eq(&self, other: &Self) -> bool {
        self.importer == other.importer
            && self.requirement == other.requirement
            && self.capability == other.capability
    }
}

impl Eq for Wire {}

impl fmt::Display for Wire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} ({} {})",
            self.importer,
            self.exporter,
            self.capability.namespace,
            self.capability.name()
        )
    }
}

/// Merged capability and requirement views of a host and its fragments
#[derive(Debug, Default)]
pub(crate) struct AggregateCache {
    pub(crate) dirty: bool,
    pub(crate) capabilities: Vec<Arc<Capability>>,
    pub(crate) requirements: Vec<Arc<Requirement>>,
    pub(crate) dynamic_requirements: Vec<Arc<Requirement>>,
}

impl AggregateCache {
    fn stale() -> Self {
        Self {
            dirty: true,
            ..Self::default()
        }
    }
}

/// One revision of a bundle
#[derive(Debug)]
pub struct Module {
    /// Owning bundle and revision number
    pub(crate) id: ModuleId,
    /// Symbolic name from the descriptor
    pub(crate) symbolic_name: String,
    /// Module version
    pub(crate) version: Version,
    /// Declared capabilities, module identity included
    pub(crate) capabilities: Vec<Arc<Capability>>,
    /// Declared package imports and module requirements
    pub(crate) requirements: Vec<Arc<Requirement>>,
    /// Declared dynamic package imports
    pub(crate) dynamic_requirements: Vec<Arc<Requirement>>,
    /// Host a fragment attaches to
    pub(crate) host_requirement: Option<Arc<Requirement>>,
    /// Name the activator is registered under
    pub(crate) activator: Option<String>,
    /// Only one revision of the symbolic name may resolve
    pub(crate) singleton: bool,

    /// Wires are committed
    pub(crate) resolved: bool,
    /// Superseded by an update or uninstall, still wired to
    pub(crate) removal_pending: bool,
    /// Refreshed away and no longer a candidate
    pub(crate) stale: bool,
    /// Wires to providers, set when resolving
    pub(crate) wires: Vec<Wire>,
    /// Attached fragments in ascending bundle id order
    pub(crate) fragments: Vec<ModuleId>,

    /// Hosts this fragment is attached to
    pub(crate) dependent_hosts: Vec<ModuleId>,
    /// Modules holding package wires to this one
    pub(crate) dependent_importers: Vec<ModuleId>,
    /// Modules holding module wires to this one
    pub(crate) dependent_requirers: Vec<ModuleId>,

    /// Capabilities and requirements merged with fragments
    pub(crate) aggregate: AggregateCache,
}

impl Module {
    /// Create module `id` from a parsed descriptor
    pub fn from_descriptor(id: ModuleId, descriptor: &ModuleDescriptor) -> Self {
        let Declarations {
            capabilities,
            requirements,
            dynamic_requirements,
            host_requirement,
        } = descriptor.declarations(id);

        Self {
            id,
            symbolic_name: descriptor.symbolic_name.clone(),
            version: descriptor.version.clone(),
            capabilities: capabilities.into_iter().map(Arc::new).collect(),
            requirements: requirements.into_iter().map(Arc::new).collect(),
            dynamic_requirements: dynamic_requirements.into_iter().map(Arc::new).collect(),
            host_requirement: host_requirement.map(Arc::new),
            activator: descriptor.activator.clone(),
            singleton: descriptor.singleton,
            resolved: false,
            removal_pending: false,
            stale: false,
            wires: Vec::new(),
            fragments: Vec::new(),
            dependent_hosts: Vec::new(),
            dependent_importers: Vec::new(),
            dependent_requirers: Vec::new(),
            aggregate: AggregateCache::stale(),
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn symbolic_name(&self) -> &str {
        &self.symbolic_name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Activator named by the descriptor
    pub fn activator(&self) -> Option<&str> {
        self.activator.as_deref()
    }

    /// Capabilities declared by this module alone
    pub fn declared_capabilities(&self) -> &[Arc<Capability>] {
        &self.capabilities
    }

    /// Requirements declared by this module alone
    pub fn declared_requirements(&self) -> &[Arc<Requirement>] {
        &self.requirements
    }

    /// Dynamic requirements declared by this module alone
    pub fn declared_dynamic_requirements(&self) -> &[Arc<Requirement>] {
        &self.dynamic_requirements
    }

    /// Host requirement, present for fragments
    pub fn host_requirement(&self) -> Option<&Arc<Requirement>> {
        self.host_requirement.as_ref()
    }

    pub fn is_fragment(&self) -> bool {
        self.host_requirement.is_some()
    }

    /// Check if the symbolic name is restricted to one resolved revision
    pub fn is_singleton(&self) -> bool {
        self.singleton
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    pub fn is_removal_pending(&self) -> bool {
        self.removal_pending
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn wires(&self) -> &[Wire] {
        &self.wires
    }

    /// Attached fragments in ascending bundle id order
    pub fn fragments(&self) -> &[ModuleId] {
        &self.fragments
    }

    pub fn dependent_hosts(&self) -> &[ModuleId] {
        &self.dependent_hosts
    }

    pub fn dependent_importers(&self) -> &[ModuleId] {
        &self.dependent_importers
    }

    pub fn dependent_requirers(&self) -> &[ModuleId] {
        &self.dependent_requirers
    }

    /// Union of all reverse edges
    pub fn dependents(&self) -> Vec<ModuleId> {
        let mut all = Vec::with_capacity(
            self.dependent_hosts.len()
                + self.dependent_importers.len()
                + self.dependent_requirers.len(),
        );
        for id in self
            .dependent_hosts
            .iter()
            .chain(&self.dependent_importers)
            .chain(&self.dependent_requirers)
        {
            if !all.contains(id) {
                all.push(*id);
            }
        }
        all
    }

    /// Extend the declared exports; only the system module does this
    pub(crate) fn extend_capabilities(&mut self, capabilities: Vec<Capability>) {
        for cap in capabilities {
            let cap = Capability {
                module: self.id,
                declared_by: self.id,
                ordinal: self.capabilities.len(),
                ..cap
            };
            self.capabilities.push(Arc::new(cap));
        }
        self.aggregate.dirty = true;
    }

    fn reverse_edges(&mut self, namespace: Namespace) -> &mut Vec<ModuleId> {
        match namespace {
            Namespace::Host => &mut self.dependent_hosts,
            Namespace::Package => &mut self.dependent_importers,
            Namespace::Module => &mut self.dependent_requirers,
        }
    }

    pub(crate) fn add_dependent(&mut self, namespace: Namespace, dependent: ModuleId) {
        let edges = self.reverse_edges(namespace);
        if !edges.contains(&dependent) {
            edges.push(dependent);
        }
    }

    pub(crate) fn remove_dependent(&mut self, namespace: Namespace, dependent: ModuleId) {
        self.reverse_edges(namespace).retain(|id| *id != dependent);
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.symbolic_name, self.id, self.version)
    }
}
