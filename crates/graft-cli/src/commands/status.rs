use anyhow::{bail, Context};
use camino::Utf8Path;

use graft_cache::{BundleArchive, BundleCache, DirCache};
use graft_core::types::BundleState;

use super::CommandContext;

/// List the bundles recorded in the configured cache
pub fn execute(ctx: &CommandContext) -> anyhow::Result<()> {
    let Some(dir) = &ctx.config.framework.cache_dir else {
        bail!("no cache-dir configured; set it in graft.toml or with --set cache-dir=DIR");
    };
    ctx.output.info(&format!("Bundle cache {}", dir));

    let archives = recorded(dir)?;
    for archive in &archives {
        // A recovered bundle always comes back INSTALLED
        ctx.output
            .bundle(archive.id.0, &archive.location, BundleState::Installed);
        ctx.output.detail(&format!(
            "start level {}, {:?}, {} revision(s), modified {}",
            archive.start_level,
            archive.persistent_state,
            archive.revisions.len(),
            archive.last_modified.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    ctx.output
        .success(&format!("{} bundle(s) recorded", archives.len()));
    Ok(())
}

/// Archives in the cache at `dir`, read without starting a framework
pub(crate) fn recorded(dir: &Utf8Path) -> anyhow::Result<Vec<BundleArchive>> {
    let cache = DirCache::open(dir).with_context(|| format!("cannot read bundle cache {}", dir))?;
    Ok(cache.archives())
}
