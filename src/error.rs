//! Error handling for scopeflow
//!
//! This module defines the crate-wide error type and a Result alias. Subsystems
//! keep their own error enums (`AccelError`, `PipelineError`, `FormatError`)
//! and convert into `ScopeError` at the API boundary.

use crate::accel::AccelError;
use crate::formats::FormatError;
use crate::pipeline::PipelineError;
use thiserror::Error;

/// Main error type for scopeflow operations
#[derive(Error, Debug)]
pub enum ScopeError {
    /// Errors raised by the compute device or accelerator buffers
    #[error("Accelerator error: {0}")]
    Accel(#[from] AccelError),

    /// Errors raised by the filter graph
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Errors raised by a file codec
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to session documents
    #[error("Session error: {0}")]
    Session(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<ScopeError>,
    },
}

impl ScopeError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        ScopeError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

impl From<serde_json::Error> for ScopeError {
    fn from(err: serde_json::Error) -> Self {
        ScopeError::Serialization(err.to_string())
    }
}

/// Result type alias for scopeflow operations
pub type Result<T> = std::result::Result<T, ScopeError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<ScopeError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScopeError::Config("missing device section".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: missing device section"
        );
    }

    #[test]
    fn test_error_with_context() {
        let err = ScopeError::Session("bad id".to_string());
        let with_ctx = err.with_context("Failed to load session");
        assert!(with_ctx.to_string().contains("Failed to load session"));
        assert!(with_ctx.to_string().contains("bad id"));
    }

    #[test]
    fn test_result_ext_converts_subsystem_errors() {
        let res: std::result::Result<(), AccelError> =
            Err(AccelError::ContractViolation("unbound slot".into()));
        let err = res.context("dispatching subtract").unwrap_err();
        assert!(err.to_string().starts_with("dispatching subtract"));
    }
}
