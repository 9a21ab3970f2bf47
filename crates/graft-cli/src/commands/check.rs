use std::fs;

use anyhow::{bail, Context};
use camino::Utf8Path;

use graft_config::{parse_descriptor, ConfigSource};

use super::{bundle_files, CommandContext};

/// Check the effective configuration and every descriptor in `bundles`
pub fn execute(bundles: Option<&Utf8Path>, ctx: &CommandContext) -> anyhow::Result<()> {
    match &ctx.source {
        ConfigSource::File(path) => ctx.output.success(&format!("Configuration {} is valid", path)),
        ConfigSource::Defaults => ctx.output.success("No graft.toml found; using defaults"),
    }

    let section = &ctx.config.framework;
    ctx.output.info(&format!(
        "begin start level {}, initial bundle level {}, {} system package(s)",
        section.begin_start_level,
        section.initial_bundle_start_level,
        ctx.config.system_packages.len()
    ));
    match &section.cache_dir {
        Some(dir) => ctx.output.info(&format!("bundle cache in {}", dir)),
        None => ctx.output.info("bundle cache in memory"),
    }

    let Some(dir) = bundles else {
        return Ok(());
    };
    let dir = ctx.path(dir);

    let mut failed = 0;
    for path in bundle_files(&dir)? {
        let content = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path))?;
        match parse_descriptor(&content, path.as_str()) {
            Ok(descriptor) => {
                let kind = if descriptor.is_fragment() { "fragment" } else { "bundle" };
                ctx.output.success(&format!(
                    "{} {} {} ({})",
                    kind,
                    descriptor.symbolic_name,
                    descriptor.version,
                    path.file_name().unwrap_or(path.as_str())
                ));
            }
            Err(err) => {
                failed += 1;
                ctx.output.error(&err.to_string());
            }
        }
    }

    if failed > 0 {
        bail!("{} descriptor(s) in {} are invalid", failed, dir);
    }
    Ok(())
}
