//! Terminal output formatting.
//!
//! Every command prints through [`OutputHandler`] so colors and symbols stay
//! consistent.

pub mod colors;
pub mod errors;

use graft_core::types::BundleState;

/// Output handler for consistent terminal formatting
pub struct OutputHandler {
    colors: colors::ColorSupport,
}

impl OutputHandler {
    pub fn new() -> Self {
        Self {
            colors: colors::ColorSupport::detect(),
        }
    }

    pub fn with_colors(colors: colors::ColorSupport) -> Self {
        Self { colors }
    }

    pub fn info(&self, message: &str) {
        println!("{}", self.colors.dim(message));
    }

    pub fn success(&self, message: &str) {
        println!("{} {}", self.colors.green("✓"), message);
    }

    pub fn warn(&self, message: &str) {
        println!("{} {}", self.colors.yellow("⚠"), message);
    }

    pub fn error(&self, message: &str) {
        eprintln!("{} {}", self.colors.red("✗"), message);
    }

    /// Print a bundle status line
    pub fn bundle(&self, id: u64, label: &str, state: BundleState) {
        println!("{:>4}  {:<12} {}", id, self.state(state), label);
    }

    /// Indented detail under the previous line
    pub fn detail(&self, message: &str) {
        println!("      {}", self.colors.dim(message));
    }

    fn state(&self, state: BundleState) -> String {
        let text = format!("{:<12}", state.to_string());
        match state {
            BundleState::Active => self.colors.green(&text),
            BundleState::Resolved => text,
            BundleState::Uninstalled => self.colors.red(&text),
            _ => self.colors.yellow(&text),
        }
    }
}

impl Default for OutputHandler {
    fn default() -> Self {
        Self::new()
    }
}
