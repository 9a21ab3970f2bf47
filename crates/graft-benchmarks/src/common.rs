//! Common utilities for benchmarks

use std::sync::Arc;
use std::time::Duration;

use criterion::Criterion;
use pprof::criterion::{Output, PProfProfiler};

use graft_core::types::{
    BundleId, Capability, ModuleDescriptor, ModuleId, Namespace, Version, VersionRange,
    VERSION_ATTR,
};

/// Configure criterion with flamegraph profiling support
pub fn criterion_config() -> Criterion {
    Criterion::default()
        .warm_up_time(Duration::from_secs(3))
        .measurement_time(Duration::from_secs(10))
        .sample_size(100)
        .with_profiler(PProfProfiler::new(100, Output::Flamegraph(None)))
}

/// Package export of `package` at `major.0.0` by bundle `bundle`
pub fn package_export(bundle: u64, package: &str, major: u64) -> Arc<Capability> {
    Arc::new(
        Capability::new(ModuleId::new(BundleId(bundle), 0), 0, Namespace::Package, package)
            .with_attribute(VERSION_ATTR, Version::new(major, 0, 0)),
    )
}

/// A chain of `length` descriptors: module `i` exports `pkg.i` and imports
/// `pkg.{i+1}`; the last one imports nothing
pub fn descriptor_chain(length: usize) -> Vec<ModuleDescriptor> {
    (0..length)
        .map(|i| {
            let descriptor = ModuleDescriptor::new(format!("bench.m{}", i), Version::new(1, 0, 0))
                .export(&format!("pkg.{}", i), Version::new(1, 0, 0));
            if i + 1 < length {
                descriptor.import(&format!("pkg.{}", i + 1), VersionRange::any())
            } else {
                descriptor
            }
        })
        .collect()
}

/// TOML form of [`descriptor_chain`], for installing through a framework
pub fn descriptor_chain_toml(length: usize) -> Vec<(String, Vec<u8>)> {
    (0..length)
        .map(|i| {
            let mut content = format!(
                "symbolic-name = \"bench.m{i}\"\nversion = \"1.0.0\"\n\n[[exports]]\nname = \"pkg.{i}\"\n"
            );
            if i + 1 < length {
                content.push_str(&format!("\n[[imports]]\nname = \"pkg.{}\"\n", i + 1));
            }
            (format!("bench:m{}", i), content.into_bytes())
        })
        .collect()
}
