//! Error message formatting with actionable suggestions.

use graft_core::error::GraftError;

use super::colors::ColorSupport;

/// Formats command errors with a suggestion and their cause chain
pub struct ErrorFormatter {
    colors: ColorSupport,
}

impl ErrorFormatter {
    pub fn new(colors: ColorSupport) -> Self {
        Self { colors }
    }

    pub fn format_error(&self, error: &anyhow::Error) -> String {
        let mut output = format!("{}: {}\n", self.colors.red("error"), error);

        let suggestion = error
            .chain()
            .find_map(|cause| cause.downcast_ref::<GraftError>())
            .and_then(GraftError::suggestion);
        if let Some(suggestion) = suggestion {
            output.push_str(&format!("\n{}: {}\n", self.colors.dim("help"), suggestion));
        }

        for cause in error.chain().skip(1) {
            output.push_str(&format!("\n{}: {}", self.colors.dim("caused by"), cause));
        }
        output
    }
}

impl Default for ErrorFormatter {
    fn default() -> Self {
        Self::new(ColorSupport::detect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graft_core::types::BundleId;

    #[test]
    fn test_format_includes_suggestion_and_causes() {
        let formatter = ErrorFormatter::new(ColorSupport::disabled());
        let error = anyhow::Error::new(GraftError::BundleNotFound {
            bundle: BundleId(7),
        })
        .context("Failed to start bundle 7");

        let text = formatter.format_error(&error);
        assert!(text.starts_with("error: Failed to start bundle 7"));
        assert!(text.contains("caused by:"));
        if let Some(suggestion) = (GraftError::BundleNotFound { bundle: BundleId(7) }).suggestion() {
            assert!(text.contains(suggestion));
        }
    }

    #[test]
    fn test_format_plain_error() {
        let formatter = ErrorFormatter::new(ColorSupport::disabled());
        let text = formatter.format_error(&anyhow::anyhow!("no bundles found"));
        assert_eq!(text, "error: no bundles found\n");
    }
}
