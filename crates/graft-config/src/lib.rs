//! Configuration parsing for Graft
//!
//! This crate handles the framework configuration file (graft.toml), the
//! TOML bundle descriptors and the layering of environment and
//! command-line overrides on top of the file.

pub mod descriptor;
pub mod merge;
pub mod toml;

// Re-export main types
pub use descriptor::{parse_descriptor, serialize_descriptor, validate_descriptor};
pub use merge::{ConfigLayering, ConfigLoader, ConfigSource, CONFIG_FILE};
pub use toml::{parse_framework_toml, FrameworkConfig, FrameworkSection, SystemPackage};

use graft_core::error::GraftError;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, GraftError>;
