//! Core data types for the Graft framework.

pub mod attribute;
pub mod capability;
pub mod descriptor;
pub mod filter;
pub mod id;
pub mod state;
pub mod version;

// Re-export all types
pub use attribute::{AttributeValue, Attributes, Comparison, Directives};
pub use capability::{
    Capability, CapabilityKey, Namespace, Requirement, BUNDLE_VERSION_ATTR, MANDATORY_DIRECTIVE,
    SINGLETON_DIRECTIVE, VERSION_ATTR,
};
pub use descriptor::{
    Declarations, DynamicImportDecl, ExportDecl, HostDecl, ImportDecl, ModuleDescriptor,
    RequireDecl,
};
pub use filter::{Filter, FilterError};
pub use id::{BundleId, ModuleId, SYSTEM_BUNDLE_ID};
pub use state::{BundleState, PersistentState};
pub use version::{Version, VersionError, VersionRange};
