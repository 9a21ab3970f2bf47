use anyhow::bail;
use camino::Utf8Path;
use tracing::info;

use graft_framework::{Activator, ActivatorError, BundleContext, Framework};

use super::{install_all, label, CommandContext, ErrorLog};

/// Activator name descriptors can use for bundles without code of their own
pub const LOG_ACTIVATOR: &str = "log";

/// Logs the bundle's start and stop
pub struct LogActivator;

impl Activator for LogActivator {
    fn start(&mut self, context: &BundleContext) -> Result<(), ActivatorError> {
        info!("Bundle {} activated", context.bundle_id());
        Ok(())
    }

    fn stop(&mut self, context: &BundleContext) -> Result<(), ActivatorError> {
        info!("Bundle {} deactivated", context.bundle_id());
        Ok(())
    }
}

/// Install and start every bundle in `dir`, report their states and shut
/// the framework down again
pub fn execute(dir: &Utf8Path, level: Option<u32>, ctx: &CommandContext) -> anyhow::Result<()> {
    let mut config = ctx.config.clone();
    if let Some(level) = level {
        config.framework.begin_start_level = level;
    }
    let framework = Framework::builder(config)
        .activator(LOG_ACTIVATOR, || LogActivator)
        .build()?;
    let errors = ErrorLog::attach(&framework);

    let bundles = install_all(&framework, &ctx.path(dir))?;
    for bundle in &bundles {
        if bundle.descriptor().is_fragment() {
            continue;
        }
        // Deferred until the framework reaches the bundle's level
        framework.start_bundle(bundle.id(), true)?;
    }
    framework.start()?;
    ctx.output
        .success(&format!("Framework running at start level {}", framework.start_level()));

    let mut failed = 0;
    for bundle in framework.bundles() {
        ctx.output.bundle(bundle.id().0, &label(&bundle), bundle.state());
        let reported = errors.for_bundle(&framework, bundle.id());
        if !reported.is_empty() {
            failed += 1;
        }
        for error in reported {
            ctx.output.error(&error);
        }
    }

    framework.shutdown()?;
    ctx.output.info("Framework stopped");

    if failed > 0 {
        bail!("{} bundle(s) failed", failed);
    }
    Ok(())
}
