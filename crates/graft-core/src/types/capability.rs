//! Capabilities, requirements and their namespaces.
//!
//! A capability is a namespaced set of attributes offered by a module; a
//! requirement is a filter over those attributes. Both are owned by one
//! module. When a fragment is merged into a host its declarations are
//! re-owned by the host while remembering the declaring fragment, which
//! keeps their identity distinct from the host's own entries.

use std::fmt;
use std::hash::{Hash, Hasher};

use super::attribute::{AttributeValue, Attributes, Directives};
use super::filter::Filter;
use super::id::ModuleId;
use super::version::{Version, VersionRange};

/// Attribute carrying a capability's version
pub const VERSION_ATTR: &str = "version";
/// Attribute carrying the providing module's version on package exports
pub const BUNDLE_VERSION_ATTR: &str = "bundle-version";
/// Directive marking a module capability as singleton
pub const SINGLETON_DIRECTIVE: &str = "singleton";
/// Directive listing attributes an importer must mention
pub const MANDATORY_DIRECTIVE: &str = "mandatory";

/// Capability namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Namespace {
    /// Module identity (symbolic name + version)
    Module,
    /// Exported package
    Package,
    /// Host identity that fragments attach to
    Host,
}

impl Namespace {
    /// All namespaces in index order
    pub const ALL: [Namespace; 3] = [Namespace::Module, Namespace::Package, Namespace::Host];

    /// Attribute holding the capability's name in this namespace
    pub fn key(&self) -> &'static str {
        match self {
            Namespace::Module => "module",
            Namespace::Package => "package",
            Namespace::Host => "host",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Identity of a capability: owner, declaring module and ordinal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapabilityKey {
    pub module: ModuleId,
    pub declared_by: ModuleId,
    pub ordinal: usize,
}

/// A namespaced fact a module offers
#[derive(Debug, Clone)]
pub struct Capability {
    /// Module providing the capability (the host for fragment contributions)
    pub module: ModuleId,
    /// Module that declared the capability
    pub declared_by: ModuleId,
    /// Position in the declaring module's capability list
    pub ordinal: usize,
    pub namespace: Namespace,
    pub attributes: Attributes,
    pub directives: Directives,
}

impl Capability {
    /// Create a capability with its name attribute set
    pub fn new(module: ModuleId, ordinal: usize, namespace: Namespace, name: &str) -> Self {
        let mut attributes = Attributes::new();
        attributes.insert(namespace.key().to_string(), AttributeValue::from(name));
        Self {
            module,
            declared_by: module,
            ordinal,
            namespace,
            attributes,
            directives: Directives::new(),
        }
    }

    /// Set an attribute
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Set a directive
    pub fn with_directive(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.directives.insert(name.into(), value.into());
        self
    }

    /// Identity key
    pub fn key(&self) -> CapabilityKey {
        CapabilityKey {
            module: self.module,
            declared_by: self.declared_by,
            ordinal: self.ordinal,
        }
    }

    /// Name in this capability's namespace (package name, symbolic name)
    pub fn name(&self) -> &str {
        self.attributes
            .get(self.namespace.key())
            .and_then(AttributeValue::as_str)
            .unwrap_or_default()
    }

    /// Declared version, `0.0.0` when absent
    pub fn version(&self) -> Version {
        self.attributes
            .get(VERSION_ATTR)
            .and_then(AttributeValue::as_version)
            .cloned()
            .unwrap_or_default()
    }

    /// Attributes an importer's filter must mention to match
    pub fn mandatory_attributes(&self) -> Vec<&str> {
        self.directives
            .get(MANDATORY_DIRECTIVE)
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Check the singleton directive
    pub fn is_singleton(&self) -> bool {
        self.directives
            .get(SINGLETON_DIRECTIVE)
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Copy re-owned by a host module
    pub fn contributed_to(&self, host: ModuleId) -> Capability {
        Capability {
            module: host,
            ..self.clone()
        }
    }

    /// Check if the capability was contributed by a fragment
    pub fn is_contributed(&self) -> bool {
        self.module != self.declared_by
    }
}

impl PartialEq for Capability {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Capability {}

impl Hash for Capability {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.module, self.namespace)?;
        for (name, value) in &self.attributes {
            write!(f, "; {}={}", name, value)?;
        }
        Ok(())
    }
}

/// A namespaced filter a module needs satisfied
#[derive(Debug, Clone)]
pub struct Requirement {
    /// Module needing the requirement (the host for fragment contributions)
    pub module: ModuleId,
    /// Module that declared the requirement
    pub declared_by: ModuleId,
    pub ordinal: usize,
    pub namespace: Namespace,
    /// Target name: package, symbolic name or host name
    pub target: String,
    pub range: VersionRange,
    pub filter: Filter,
    pub optional: bool,
    pub dynamic: bool,
    pub directives: Directives,
}

impl Requirement {
    /// Create a requirement for `target` within `range`.
    ///
    /// Targets containing `*` (dynamic imports) become substring filters.
    pub fn new(
        module: ModuleId,
        ordinal: usize,
        namespace: Namespace,
        target: &str,
        range: VersionRange,
    ) -> Self {
        let name_filter = if target.contains('*') {
            if target == "*" {
                Filter::Present {
                    attr: namespace.key().to_string(),
                }
            } else {
                Filter::Substring {
                    attr: namespace.key().to_string(),
                    pieces: target.split('*').map(str::to_string).collect(),
                }
            }
        } else {
            Filter::equal(namespace.key(), target)
        };
        let filter = Filter::and(vec![name_filter, Filter::from_range(VERSION_ATTR, &range)]);

        Self {
            module,
            declared_by: module,
            ordinal,
            namespace,
            target: target.to_string(),
            range,
            filter,
            optional: false,
            dynamic: false,
            directives: Directives::new(),
        }
    }

    /// Mark optional
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Mark dynamic
    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self.optional = true;
        self
    }

    /// Require an additional attribute value on matching capabilities
    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        let existing = std::mem::replace(&mut self.filter, Filter::MatchAll);
        self.filter = Filter::and(vec![existing, Filter::equal(name, value)]);
        self
    }

    /// Replace the filter outright
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Set a directive
    pub fn with_directive(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.directives.insert(name.into(), value.into());
        self
    }

    /// Check if a capability satisfies this requirement (mandatory attributes ignored)
    pub fn matches(&self, capability: &Capability) -> bool {
        capability.namespace == self.namespace && self.filter.matches(&capability.attributes)
    }

    /// Copy re-owned by a host module
    pub fn contributed_to(&self, host: ModuleId) -> Requirement {
        Requirement {
            module: host,
            ..self.clone()
        }
    }

    /// Check if a merged requirement would contradict this one.
    ///
    /// Two requirements conflict when they target the same name in the same
    /// namespace but disagree on range, optionality or directives.
    pub fn conflicts_with(&self, other: &Requirement) -> bool {
        self.namespace == other.namespace
            && self.target == other.target
            && (self.range != other.range
                || self.optional != other.optional
                || self.directives != other.directives
                || self.filter != other.filter)
    }
}

impl PartialEq for Requirement {
    fn eq(&self, other: &Self) -> bool {
        (self.module, self.declared_by, self.ordinal, self.dynamic)
            == (other.module, other.declared_by, other.ordinal, other.dynamic)
    }
}

impl Eq for Requirement {}

impl Hash for Requirement {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.module, self.declared_by, self.ordinal, self.dynamic).hash(state);
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}; {}", self.module, self.namespace, self.filter)?;
        if self.optional {
            f.write_str(" (optional)")?;
        }
        Ok(())
    }
}
