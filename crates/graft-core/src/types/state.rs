//! Bundle lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Live state of a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BundleState {
    Installed,
    Resolved,
    Starting,
    Active,
    Stopping,
    Uninstalled,
}

/// State recorded in the archive, surviving restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistentState {
    #[default]
    Installed,
    Active,
    Uninstalled,
}

impl BundleState {
    /// Check if the bundle is in a transient state
    pub fn is_transient(&self) -> bool {
        matches!(self, BundleState::Starting | BundleState::Stopping)
    }

    /// Check if the bundle has a resolved module
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            BundleState::Resolved
                | BundleState::Starting
                | BundleState::Active
                | BundleState::Stopping
        )
    }
}

impl fmt::Display for BundleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BundleState::Installed => "INSTALLED",
            BundleState::Resolved => "RESOLVED",
            BundleState::Starting => "STARTING",
            BundleState::Active => "ACTIVE",
            BundleState::Stopping => "STOPPING",
            BundleState::Uninstalled => "UNINSTALLED",
        };
        f.write_str(name)
    }
}

impl fmt::Display for PersistentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PersistentState::Installed => "installed",
            PersistentState::Active => "active",
            PersistentState::Uninstalled => "uninstalled",
        };
        f.write_str(name)
    }
}
