//! Integer identities for bundles and module revisions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of an installed bundle
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BundleId(pub u64);

/// The framework's own bundle
pub const SYSTEM_BUNDLE_ID: BundleId = BundleId(0);

/// Identifier of one module revision, rendered `bundle.revision`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModuleId {
    pub bundle: BundleId,
    pub revision: u32,
}

impl BundleId {
    /// Check if this is the system bundle
    pub fn is_system(self) -> bool {
        self == SYSTEM_BUNDLE_ID
    }

    /// Id following this one
    pub fn next(self) -> Self {
        BundleId(self.0 + 1)
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BundleId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(BundleId)
    }
}

impl ModuleId {
    /// Create a module id
    pub fn new(bundle: BundleId, revision: u32) -> Self {
        Self { bundle, revision }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.bundle, self.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(ModuleId::new(BundleId(3), 1).to_string(), "3.1");
        assert_eq!("12".parse::<BundleId>().unwrap(), BundleId(12));
        assert!(SYSTEM_BUNDLE_ID.is_system());
        assert_eq!(BundleId(4).next(), BundleId(5));
    }

    #[test]
    fn test_ordering_follows_bundle_then_revision() {
        let a = ModuleId::new(BundleId(1), 5);
        let b = ModuleId::new(BundleId(2), 0);
        assert!(a < b);
        assert!(ModuleId::new(BundleId(2), 1) > b);
    }
}
