use anyhow::bail;
use camino::Utf8Path;
use serde::Serialize;

use graft_core::types::BundleState;
use graft_framework::Framework;
use tracing::debug;

use super::{install_all, CommandContext, ErrorLog};

/// One bundle in the resolve report
#[derive(Debug, Serialize)]
pub struct BundleReport {
    pub id: u64,
    pub name: String,
    pub version: String,
    pub state: String,
    #[serde(skip)]
    pub lifecycle: BundleState,
    pub wires: Vec<WireReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct WireReport {
    pub namespace: String,
    pub name: String,
    pub provider: u64,
}

/// Install the bundles in `dir` into an in-memory framework and resolve
/// all of them
pub fn execute(dir: &Utf8Path, json: bool, ctx: &CommandContext) -> anyhow::Result<()> {
    let reports = resolve_dir(&ctx.path(dir), ctx)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            ctx.output.bundle(
                report.id,
                &format!("{} {}", report.name, report.version),
                report.lifecycle,
            );
            for wire in &report.wires {
                ctx.output.detail(&format!(
                    "{} {} from bundle {}",
                    wire.namespace, wire.name, wire.provider
                ));
            }
            for error in &report.errors {
                ctx.output.error(error);
            }
        }
    }

    let unresolved = reports.iter().filter(|report| !report.errors.is_empty()).count();
    if unresolved > 0 {
        bail!("{} bundle(s) did not resolve", unresolved);
    }
    Ok(())
}

pub fn resolve_dir(dir: &Utf8Path, ctx: &CommandContext) -> anyhow::Result<Vec<BundleReport>> {
    let mut config = ctx.config.clone();
    config.framework.cache_dir = None;
    let framework = Framework::new(config)?;
    let errors = ErrorLog::attach(&framework);

    let bundles = install_all(&framework, dir)?;
    framework.resolve_bundles(None)?;

    let reports = bundles
        .iter()
        .map(|bundle| {
            let wires = bundle
                .current_module()
                .map(|module| framework.wires(module))
                .unwrap_or_default()
                .iter()
                .map(|wire| WireReport {
                    namespace: wire.namespace().to_string(),
                    name: wire.capability.name().to_string(),
                    provider: wire.exporter.bundle.0,
                })
                .collect();
            BundleReport {
                id: bundle.id().0,
                name: bundle.symbolic_name(),
                version: bundle.version().to_string(),
                state: bundle.state().to_string(),
                lifecycle: bundle.state(),
                wires,
                errors: errors.for_bundle(&framework, bundle.id()),
            }
        })
        .collect();

    debug!("Resolved {} bundle(s) from {}", bundles.len(), dir);
    framework.shutdown()?;
    Ok(reports)
}
