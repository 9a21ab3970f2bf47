//! Bundle descriptor parsing
//!
//! Bundles describe themselves with a small TOML document: symbolic name,
//! version, exports, imports, module requirements, dynamic imports and an
//! optional fragment host.

use graft_core::error::GraftError;
use graft_core::types::ModuleDescriptor;
use tracing::debug;

use crate::ConfigResult;

/// Parse a descriptor read from `location`
pub fn parse_descriptor(content: &str, location: &str) -> ConfigResult<ModuleDescriptor> {
    let descriptor: ModuleDescriptor =
        toml::from_str(content).map_err(|e| GraftError::DescriptorParse {
            location: location.to_string(),
            message: e.message().to_string(),
        })?;

    validate_descriptor(&descriptor, location)?;
    debug!(
        "Parsed descriptor {} {} from {}",
        descriptor.symbolic_name, descriptor.version, location
    );
    Ok(descriptor)
}

/// Serialize a descriptor to TOML
pub fn serialize_descriptor(descriptor: &ModuleDescriptor) -> ConfigResult<String> {
    toml::to_string_pretty(descriptor).map_err(|e| GraftError::DescriptorParse {
        location: descriptor.symbolic_name.clone(),
        message: format!("TOML serialization error: {}", e),
    })
}

/// Check a descriptor for structural mistakes
pub fn validate_descriptor(descriptor: &ModuleDescriptor, location: &str) -> ConfigResult<()> {
    let invalid = |message: String| GraftError::DescriptorParse {
        location: location.to_string(),
        message,
    };

    if !is_valid_symbolic_name(&descriptor.symbolic_name) {
        return Err(invalid(format!(
            "invalid symbolic name '{}'; use letters, digits, '.', '-' or '_'",
            descriptor.symbolic_name
        )));
    }

    if descriptor.is_fragment() && descriptor.activator.is_some() {
        return Err(invalid("fragments cannot declare an activator".to_string()));
    }

    if let Some(host) = &descriptor.fragment_host {
        if host.name == descriptor.symbolic_name {
            return Err(invalid("a fragment cannot be its own host".to_string()));
        }
    }

    let mut exported: Vec<&str> = Vec::new();
    for export in &descriptor.exports {
        if !is_valid_symbolic_name(&export.name) {
            return Err(invalid(format!("invalid export name '{}'", export.name)));
        }
        if exported.contains(&export.name.as_str()) {
            return Err(invalid(format!("package '{}' is exported twice", export.name)));
        }
        for attr in &export.mandatory {
            if !export.attributes.contains_key(attr) {
                return Err(invalid(format!(
                    "mandatory attribute '{}' of '{}' has no value",
                    attr, export.name
                )));
            }
        }
        exported.push(&export.name);
    }

    let mut imported: Vec<&str> = Vec::new();
    for import in &descriptor.imports {
        if !is_valid_symbolic_name(&import.name) {
            return Err(invalid(format!("invalid import name '{}'", import.name)));
        }
        if imported.contains(&import.name.as_str()) {
            return Err(invalid(format!("package '{}' is imported twice", import.name)));
        }
        imported.push(&import.name);
    }

    for require in &descriptor.requires {
        if !is_valid_symbolic_name(&require.name) {
            return Err(invalid(format!("invalid module name '{}'", require.name)));
        }
    }

    for dynamic in &descriptor.dynamic_imports {
        let pattern_ok = dynamic.name == "*"
            || is_valid_symbolic_name(&dynamic.name.replace('*', "x"));
        if !pattern_ok {
            return Err(invalid(format!("invalid dynamic import '{}'", dynamic.name)));
        }
    }

    Ok(())
}

/// Check if a symbolic or package name is well formed
fn is_valid_symbolic_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with('.')
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_'))
}
