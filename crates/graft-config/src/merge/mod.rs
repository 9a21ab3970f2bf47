//! Configuration layering: file, environment and command-line overrides

use std::collections::HashMap;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use graft_core::error::GraftError;

use crate::toml::{load_from_file, validate_config, FrameworkConfig};
use crate::ConfigResult;

/// Name of the framework configuration file
pub const CONFIG_FILE: &str = "graft.toml";

/// Locates and loads the framework configuration file
pub struct ConfigLoader {
    /// Directory the search starts from
    cwd: Utf8PathBuf,
}

/// Where the effective configuration came from
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    /// A graft.toml file
    File(Utf8PathBuf),
    /// No file found; built-in defaults
    Defaults,
}

impl ConfigLoader {
    pub fn new(cwd: Utf8PathBuf) -> Self {
        Self { cwd }
    }

    /// Load graft.toml from the working directory or one of its parents,
    /// falling back to defaults
    pub fn load(&self) -> ConfigResult<(FrameworkConfig, ConfigSource)> {
        match self.resolve_config_path(CONFIG_FILE) {
            Some(path) => {
                let config = load_from_file(&path)?;
                debug!("Loaded configuration from {}", path);
                Ok((config, ConfigSource::File(path)))
            }
            None => Ok((FrameworkConfig::default(), ConfigSource::Defaults)),
        }
    }

    /// Find a file in the working directory or its ancestors
    pub fn resolve_config_path(&self, filename: &str) -> Option<Utf8PathBuf> {
        let mut current: Option<&Utf8Path> = Some(self.cwd.as_path());
        while let Some(dir) = current {
            let candidate = dir.join(filename);
            if candidate.exists() {
                return Some(candidate);
            }
            current = dir.parent();
        }
        None
    }
}

/// Configuration layering and merging
pub struct ConfigLayering;

impl ConfigLayering {
    /// Apply environment overrides, then command-line overrides, to a file
    /// configuration and validate the result
    pub fn merge_configs(
        file_config: FrameworkConfig,
        env_overrides: HashMap<String, String>,
        cli_overrides: HashMap<String, String>,
    ) -> ConfigResult<FrameworkConfig> {
        let mut merged = file_config;

        for (key, value) in &env_overrides {
            let field = match key.as_str() {
                "GRAFT_BEGIN_START_LEVEL" => "begin-start-level",
                "GRAFT_INITIAL_BUNDLE_START_LEVEL" => "initial-bundle-start-level",
                "GRAFT_CACHE_DIR" => "cache-dir",
                "GRAFT_PURGE_UNUSED" => "purge-unused",
                "GRAFT_EVENT_QUEUE" => "event-queue",
                _ => continue,
            };
            Self::apply_override(&mut merged, field, value, key)?;
        }

        for (field, value) in &cli_overrides {
            Self::apply_override(&mut merged, field, value, field)?;
        }

        validate_config(&merged)?;
        Ok(merged)
    }

    fn apply_override(
        config: &mut FrameworkConfig,
        field: &str,
        value: &str,
        origin: &str,
    ) -> ConfigResult<()> {
        let section = &mut config.framework;
        match field {
            "begin-start-level" => section.begin_start_level = parse_value(value, origin)?,
            "initial-bundle-start-level" => {
                section.initial_bundle_start_level = parse_value(value, origin)?
            }
            "cache-dir" => {
                section.cache_dir = if value.is_empty() {
                    None
                } else {
                    Some(Utf8PathBuf::from(value))
                }
            }
            "purge-unused" => section.purge_unused = parse_flag(value, origin)?,
            "event-queue" => section.event_queue = parse_value(value, origin)?,
            _ => {
                // Unknown override, ignore
                debug!("Ignoring unknown configuration override {}", origin);
            }
        }
        Ok(())
    }

    /// Collect GRAFT_* environment variables
    pub fn collect_env_overrides() -> HashMap<String, String> {
        std::env::vars()
            .filter(|(key, _)| key.starts_with("GRAFT_"))
            .collect()
    }
}

fn parse_value<T>(value: &str, origin: &str) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| GraftError::ConfigValidation {
            field: origin.to_string(),
            reason: format!("invalid value '{}': {}", value, e),
        })
}

fn parse_flag(value: &str, origin: &str) -> ConfigResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(GraftError::ConfigValidation {
            field: origin.to_string(),
            reason: format!("invalid boolean '{}'", value),
        }),
    }
}
