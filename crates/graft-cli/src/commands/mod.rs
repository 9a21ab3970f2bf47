//! Command implementations and dispatch.
//!
//! Every command takes the shared [`CommandContext`]: the working
//! directory, the effective framework configuration and the output handler.

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use graft_config::toml::load_from_file;
use graft_config::{ConfigLayering, ConfigLoader, ConfigSource, FrameworkConfig};
use graft_core::types::BundleId;
use graft_framework::{Bundle, Event, Framework, FrameworkEventKind};

pub mod check;
pub mod resolve;
pub mod run;
pub mod status;

#[cfg(test)]
mod tests;

use crate::{output::OutputHandler, Commands};

/// Shared context for all commands
pub struct CommandContext {
    pub cwd: Utf8PathBuf,
    pub output: OutputHandler,
    pub config: FrameworkConfig,
    pub source: ConfigSource,
}

impl CommandContext {
    /// Load the configuration from `config_path` or by searching upwards
    /// from the working directory, then apply GRAFT_* environment variables
    /// and `--set` overrides
    pub fn new(config_path: Option<&Utf8Path>, overrides: &[String]) -> anyhow::Result<Self> {
        let cwd = std::env::current_dir().context("Failed to get current directory")?;
        let cwd = Utf8PathBuf::try_from(cwd).context("Working directory is not valid UTF-8")?;

        let (config, source) = match config_path {
            Some(path) => (
                load_from_file(path)?,
                ConfigSource::File(path.to_path_buf()),
            ),
            None => ConfigLoader::new(cwd.clone()).load()?,
        };
        let config = ConfigLayering::merge_configs(
            config,
            ConfigLayering::collect_env_overrides(),
            parse_overrides(overrides)?,
        )?;
        debug!("Effective configuration from {:?}", source);

        Ok(Self {
            cwd,
            output: OutputHandler::new(),
            config,
            source,
        })
    }

    /// Resolve a command-line path against the working directory
    pub fn path(&self, path: &Utf8Path) -> Utf8PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }
}

/// Dispatch a command to its handler
pub fn dispatch_command(command: Commands, ctx: &CommandContext) -> anyhow::Result<()> {
    match command {
        Commands::Check { bundles } => {
            info!("Checking configuration");
            check::execute(bundles.as_deref(), ctx)
        }
        Commands::Resolve { bundles, json } => {
            info!("Resolving bundles in {}", bundles);
            resolve::execute(&bundles, json, ctx)
        }
        Commands::Run { bundles, level } => {
            info!("Running bundles in {}", bundles);
            run::execute(&bundles, level, ctx)
        }
        Commands::Status => {
            info!("Listing cached bundles");
            status::execute(ctx)
        }
    }
}

/// Split `KEY=VALUE` arguments into an override map
pub fn parse_overrides(overrides: &[String]) -> anyhow::Result<HashMap<String, String>> {
    overrides
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            _ => bail!("invalid override '{}', expected KEY=VALUE", entry),
        })
        .collect()
}

/// Descriptor files (`*.toml`) directly inside `dir`, sorted by name
pub fn bundle_files(dir: &Utf8Path) -> anyhow::Result<Vec<Utf8PathBuf>> {
    let entries = dir
        .read_dir_utf8()
        .with_context(|| format!("Failed to read bundle directory {}", dir))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to read bundle directory {}", dir))?;
        let path = entry.path();
        if path.extension() == Some("toml") && path.is_file() {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

/// Install every descriptor in `dir`; locations are `file:` URLs of the
/// descriptor paths
pub fn install_all(framework: &Framework, dir: &Utf8Path) -> anyhow::Result<Vec<Arc<Bundle>>> {
    let files = bundle_files(dir)?;
    if files.is_empty() {
        bail!("no bundle descriptors (*.toml) found in {}", dir);
    }

    files
        .iter()
        .map(|path| {
            let content = fs::read(path).with_context(|| format!("Failed to read {}", path))?;
            framework
                .install(&format!("file:{}", path), &content)
                .with_context(|| format!("Failed to install {}", path))
        })
        .collect()
}

/// Framework errors reported while a command runs
#[derive(Clone, Default)]
pub struct ErrorLog {
    errors: Arc<Mutex<Vec<(BundleId, String)>>>,
}

impl ErrorLog {
    pub fn attach(framework: &Framework) -> Self {
        let log = Self::default();
        let errors = Arc::clone(&log.errors);
        framework.add_listener(Arc::new(move |event: &Event| {
            if let Event::Framework {
                kind: FrameworkEventKind::Error,
                bundle,
                message: Some(message),
            } = event
            {
                if let Ok(mut errors) = errors.lock() {
                    errors.push((*bundle, message.clone()));
                }
            }
        }));
        log
    }

    /// Errors reported for one bundle, once delivered
    pub fn for_bundle(&self, framework: &Framework, bundle: BundleId) -> Vec<String> {
        framework.flush_events();
        self.errors
            .lock()
            .map(|errors| {
                errors
                    .iter()
                    .filter(|(id, _)| *id == bundle)
                    .map(|(_, message)| message.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// `name version` of a bundle, or its location when it has no module
pub fn label(bundle: &Bundle) -> String {
    match bundle.current_module() {
        Some(_) => format!("{} {}", bundle.symbolic_name(), bundle.version()),
        None => bundle.location().to_string(),
    }
}
