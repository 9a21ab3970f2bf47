//! Declarative bundle descriptors.
//!
//! A descriptor is the parsed form of a bundle's manifest: identity,
//! exports, imports, module requirements and an optional fragment host.
//! [`ModuleDescriptor::declarations`] turns it into the capabilities and
//! requirements of one module revision.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::attribute::AttributeValue;
use super::capability::{
    Capability, Namespace, Requirement, BUNDLE_VERSION_ATTR, MANDATORY_DIRECTIVE,
    SINGLETON_DIRECTIVE, VERSION_ATTR,
};
use super::id::ModuleId;
use super::version::{Version, VersionRange};

/// Parsed bundle manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModuleDescriptor {
    pub symbolic_name: String,

    #[serde(default)]
    pub version: Version,

    #[serde(default)]
    pub singleton: bool,

    /// Name of the activator to create on start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activator: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_host: Option<HostDecl>,

    #[serde(default)]
    pub exports: Vec<ExportDecl>,

    #[serde(default)]
    pub imports: Vec<ImportDecl>,

    #[serde(default)]
    pub requires: Vec<RequireDecl>,

    #[serde(default)]
    pub dynamic_imports: Vec<DynamicImportDecl>,
}

/// Fragment host declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HostDecl {
    pub name: String,
    #[serde(default)]
    pub range: VersionRange,
}

/// Exported package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExportDecl {
    pub name: String,
    #[serde(default)]
    pub version: Version,
    /// Attributes importers must name in their filter
    #[serde(default)]
    pub mandatory: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Imported package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImportDecl {
    pub name: String,
    #[serde(default)]
    pub range: VersionRange,
    #[serde(default)]
    pub optional: bool,
    /// Attribute values the exporter must carry
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Required module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RequireDecl {
    pub name: String,
    #[serde(default)]
    pub range: VersionRange,
    #[serde(default)]
    pub optional: bool,
}

/// Dynamically imported package pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DynamicImportDecl {
    pub name: String,
    #[serde(default)]
    pub range: VersionRange,
}

/// Capabilities and requirements of one module revision
#[derive(Debug, Clone, Default)]
pub struct Declarations {
    pub capabilities: Vec<Capability>,
    pub requirements: Vec<Requirement>,
    pub dynamic_requirements: Vec<Requirement>,
    /// Host requirement, present for fragments
    pub host_requirement: Option<Requirement>,
}

impl ModuleDescriptor {
    /// Create a descriptor with only an identity
    pub fn new(symbolic_name: impl Into<String>, version: Version) -> Self {
        Self {
            symbolic_name: symbolic_name.into(),
            version,
            singleton: false,
            activator: None,
            fragment_host: None,
            exports: Vec::new(),
            imports: Vec::new(),
            requires: Vec::new(),
            dynamic_imports: Vec::new(),
        }
    }

    /// Check if this describes a fragment
    pub fn is_fragment(&self) -> bool {
        self.fragment_host.is_some()
    }

    /// Add an exported package
    pub fn export(mut self, name: &str, version: Version) -> Self {
        self.exports.push(ExportDecl {
            name: name.to_string(),
            version,
            mandatory: Vec::new(),
            attributes: BTreeMap::new(),
        });
        self
    }

    /// Add an imported package
    pub fn import(mut self, name: &str, range: VersionRange) -> Self {
        self.imports.push(ImportDecl {
            name: name.to_string(),
            range,
            optional: false,
            attributes: BTreeMap::new(),
        });
        self
    }

    /// Add a required module
    pub fn require(mut self, name: &str, range: VersionRange) -> Self {
        self.requires.push(RequireDecl {
            name: name.to_string(),
            range,
            optional: false,
        });
        self
    }

    /// Declare the fragment host
    pub fn fragment_of(mut self, host: &str, range: VersionRange) -> Self {
        self.fragment_host = Some(HostDecl {
            name: host.to_string(),
            range,
        });
        self
    }

    /// Mark singleton
    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    /// Name the activator
    pub fn with_activator(mut self, name: &str) -> Self {
        self.activator = Some(name.to_string());
        self
    }

    /// Build the declarations of module `id`.
    ///
    /// Fragments declare no module or host capability; their exports and
    /// imports only take effect through the host they attach to.
    pub fn declarations(&self, id: ModuleId) -> Declarations {
        let mut capabilities = Vec::new();

        if !self.is_fragment() {
            let mut module_cap = Capability::new(id, 0, Namespace::Module, &self.symbolic_name)
                .with_attribute(VERSION_ATTR, self.version.clone());
            if self.singleton {
                module_cap = module_cap.with_directive(SINGLETON_DIRECTIVE, "true");
            }
            capabilities.push(module_cap);

            let mut host_cap = Capability::new(id, 1, Namespace::Host, &self.symbolic_name)
                .with_attribute(VERSION_ATTR, self.version.clone());
            if self.singleton {
                host_cap = host_cap.with_directive(SINGLETON_DIRECTIVE, "true");
            }
            capabilities.push(host_cap);
        }

        for export in &self.exports {
            let ordinal = capabilities.len();
            let mut cap = Capability::new(id, ordinal, Namespace::Package, &export.name)
                .with_attribute(VERSION_ATTR, export.version.clone())
                .with_attribute(Namespace::Module.key(), self.symbolic_name.as_str())
                .with_attribute(BUNDLE_VERSION_ATTR, self.version.clone());
            for (name, value) in &export.attributes {
                cap = cap.with_attribute(name.clone(), AttributeValue::from(value.as_str()));
            }
            if !export.mandatory.is_empty() {
                cap = cap.with_directive(MANDATORY_DIRECTIVE, export.mandatory.join(","));
            }
            capabilities.push(cap);
        }

        let mut requirements = Vec::new();
        for import in &self.imports {
            let mut req = Requirement::new(
                id,
                requirements.len(),
                Namespace::Package,
                &import.name,
                import.range.clone(),
            );
            for (name, value) in &import.attributes {
                req = req.with_attribute(name, value);
            }
            if import.optional {
                req = req.optional();
            }
            requirements.push(req);
        }
        for require in &self.requires {
            let mut req = Requirement::new(
                id,
                requirements.len(),
                Namespace::Module,
                &require.name,
                require.range.clone(),
            );
            if require.optional {
                req = req.optional();
            }
            requirements.push(req);
        }

        let dynamic_requirements = self
            .dynamic_imports
            .iter()
            .enumerate()
            .map(|(ordinal, import)| {
                Requirement::new(
                    id,
                    ordinal,
                    Namespace::Package,
                    &import.name,
                    import.range.clone(),
                )
                .dynamic()
            })
            .collect();

        let host_requirement = self.fragment_host.as_ref().map(|host| {
            Requirement::new(id, usize::MAX, Namespace::Host, &host.name, host.range.clone())
        });

        Declarations {
            capabilities,
            requirements,
            dynamic_requirements,
            host_requirement,
        }
    }
}
