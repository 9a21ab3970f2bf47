//! graft.toml framework configuration parsing and serialization

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::fs;

use graft_core::error::GraftError;
use graft_core::types::Version;

use crate::ConfigResult;

/// Complete graft.toml configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FrameworkConfig {
    /// Framework settings
    #[serde(default)]
    pub framework: FrameworkSection,

    /// Packages exported by the system bundle
    #[serde(default)]
    pub system_packages: Vec<SystemPackage>,
}

/// [framework] section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FrameworkSection {
    /// Start level reached by `Framework::start`
    pub begin_start_level: u32,

    /// Start level given to newly installed bundles
    pub initial_bundle_start_level: u32,

    /// Bundle cache directory; bundles are kept in memory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<Utf8PathBuf>,

    /// Refresh updated or uninstalled bundles at once when nothing uses them
    pub purge_unused: bool,

    /// Capacity of the event delivery queue
    pub event_queue: usize,
}

impl Default for FrameworkSection {
    fn default() -> Self {
        Self {
            begin_start_level: 1,
            initial_bundle_start_level: 1,
            cache_dir: None,
            purge_unused: true,
            event_queue: 1024,
        }
    }
}

/// Package exported by the system bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemPackage {
    pub name: String,
    #[serde(default)]
    pub version: Version,
}

impl FrameworkConfig {
    /// System packages as (name, version) pairs
    pub fn system_package_list(&self) -> Vec<(String, Version)> {
        self.system_packages
            .iter()
            .map(|package| (package.name.clone(), package.version.clone()))
            .collect()
    }
}

/// Parse TOML string to FrameworkConfig
pub fn parse_framework_toml(content: &str) -> ConfigResult<FrameworkConfig> {
    let config: FrameworkConfig =
        toml::from_str(content).map_err(|e| GraftError::ConfigValidation {
            field: "graft.toml".to_string(),
            reason: format!("TOML parsing error: {}", e),
        })?;

    validate_config(&config)?;
    Ok(config)
}

/// Serialize FrameworkConfig to TOML string
pub fn serialize_framework_toml(config: &FrameworkConfig) -> ConfigResult<String> {
    toml::to_string_pretty(config).map_err(|e| GraftError::ConfigValidation {
        field: "graft.toml".to_string(),
        reason: format!("TOML serialization error: {}", e),
    })
}

/// Validate configuration values
pub fn validate_config(config: &FrameworkConfig) -> ConfigResult<()> {
    if config.framework.initial_bundle_start_level < 1 {
        return Err(GraftError::ConfigValidation {
            field: "initial-bundle-start-level".to_string(),
            reason: "bundle start levels start at 1".to_string(),
        });
    }

    if config.framework.event_queue == 0 {
        return Err(GraftError::ConfigValidation {
            field: "event-queue".to_string(),
            reason: "the event queue needs room for at least one event".to_string(),
        });
    }

    let mut seen = Vec::new();
    for package in &config.system_packages {
        if package.name.trim().is_empty() {
            return Err(GraftError::ConfigValidation {
                field: "system-packages".to_string(),
                reason: "package names cannot be empty".to_string(),
            });
        }
        if seen.contains(&package.name.as_str()) {
            return Err(GraftError::ConfigValidation {
                field: "system-packages".to_string(),
                reason: format!("package '{}' is listed twice", package.name),
            });
        }
        seen.push(package.name.as_str());
    }

    Ok(())
}

/// Load and parse graft.toml from file path
pub fn load_from_file(path: &Utf8Path) -> ConfigResult<FrameworkConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| GraftError::io(format!("Failed to read {}", path), e))?;

    parse_framework_toml(&content).map_err(|e| match e {
        GraftError::ConfigValidation { field, reason } => GraftError::ConfigValidation {
            field,
            reason: format!("in file {}: {}", path, reason),
        },
        other => other,
    })
}
