//! Error types and result aliases for Graft operations.
//!
//! Provides a unified error type covering resolution, lifecycle, locking,
//! persistence and activation failures with actionable messages.

use thiserror::Error;

use crate::types::{BundleId, BundleState, FilterError, VersionError};

/// Unified error type for all Graft operations
#[derive(Error, Debug)]
pub enum GraftError {
    // Resolution errors
    #[error("Unable to resolve {module}: {reason}")]
    ResolutionConflict { module: String, reason: String },

    // Lifecycle errors
    #[error("Cannot {operation} bundle {bundle} while it is {state}")]
    LifecycleState {
        bundle: BundleId,
        state: BundleState,
        operation: &'static str,
    },

    #[error("Bundle {bundle} is not installed")]
    BundleNotFound { bundle: BundleId },

    #[error("Invalid start level {level}: {reason}")]
    InvalidStartLevel { level: u32, reason: String },

    #[error("Activator error in bundle {bundle}: {message}")]
    Activation {
        bundle: BundleId,
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    // Locking errors
    #[error("Interrupted while waiting for {resource}")]
    LockInterrupted { resource: String },

    #[error("Bundle {bundle} is locked by another operation")]
    LockContended { bundle: BundleId },

    // Persistence errors
    #[error("Persistence error: {message}")]
    Persistence {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Integrity check failed for {bundle}: expected {expected}, got {actual}")]
    IntegrityFailure {
        bundle: String,
        expected: String,
        actual: String,
    },

    // Descriptor and config errors
    #[error("Failed to parse descriptor of {location}: {message}")]
    DescriptorParse { location: String, message: String },

    #[error("Configuration field '{field}' is invalid: {reason}")]
    ConfigValidation { field: String, reason: String },

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Version(#[from] VersionError),
}

/// Result type alias for Graft operations
pub type GraftResult<T> = Result<T, GraftError>;

impl GraftError {
    /// Create a persistence error from std::io::Error
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Persistence {
            message: message.into(),
            source,
        }
    }

    /// Create a resolution conflict
    pub fn resolution(module: impl ToString, reason: impl Into<String>) -> Self {
        Self::ResolutionConflict {
            module: module.to_string(),
            reason: reason.into(),
        }
    }

    /// Wrap an error raised by a bundle activator
    pub fn activation<E>(bundle: BundleId, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let source = source.into();
        Self::Activation {
            bundle,
            message: source.to_string(),
            source,
        }
    }

    /// Create a lifecycle state error
    pub fn state(bundle: BundleId, state: BundleState, operation: &'static str) -> Self {
        Self::LifecycleState {
            bundle,
            state,
            operation,
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GraftError::ResolutionConflict { .. }
                | GraftError::Persistence { .. }
                | GraftError::LockContended { .. }
        )
    }

    /// Get a user-friendly suggestion for fixing this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            GraftError::ResolutionConflict { .. } => {
                Some("Install a bundle exporting the missing capability, or mark the import optional")
            },
            GraftError::LifecycleState { .. } => {
                Some("Wait for the running lifecycle operation to finish and retry")
            },
            GraftError::BundleNotFound { .. } => {
                Some("The bundle was uninstalled; refresh packages and look it up again")
            },
            GraftError::DescriptorParse { .. } => {
                Some("Check the bundle descriptor against the documented TOML layout")
            },
            GraftError::Persistence { .. } => {
                Some("Check that the cache directory exists and is writable")
            },
            GraftError::LockContended { .. } => {
                Some("Retry once the other operation on the bundle has finished")
            },
            _ => None,
        }
    }
}
