//! Manifest parsing
//!
//! The lifecycle code only sees [`ModuleDescriptor`]s; how raw bundle
//! content becomes one is up to the [`ManifestParser`].

use graft_config::parse_descriptor;
use graft_core::error::{GraftError, GraftResult};
use graft_core::types::ModuleDescriptor;

/// Turns stored bundle content into a descriptor
pub trait ManifestParser: Send + Sync {
    fn parse(&self, location: &str, content: &[u8]) -> GraftResult<ModuleDescriptor>;
}

/// Reads TOML bundle descriptors
#[derive(Debug, Default, Clone, Copy)]
pub struct DescriptorParser;

impl ManifestParser for DescriptorParser {
    fn parse(&self, location: &str, content: &[u8]) -> GraftResult<ModuleDescriptor> {
        let text = std::str::from_utf8(content).map_err(|e| GraftError::DescriptorParse {
            location: location.to_string(),
            message: format!("descriptor is not UTF-8: {}", e),
        })?;
        parse_descriptor(text, location)
    }
}
