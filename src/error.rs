//! Error handling for the on-device inference orchestrator
//!
//! All native-boundary failures are caught at the call site and converted to
//! one of these variants; nothing in this crate panics across the boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the orchestration layer
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum EngineError {
    /// Model file missing, unreadable, or rejected by the native engine
    #[error("Load failure: {message}")]
    LoadFailure { message: String },

    /// Requested context window could not be allocated
    #[error("Context init failure: {message}")]
    ContextInitFailure { message: String },

    /// Prompt exceeded the tokenizer buffer capacity
    #[error("Tokenization failure: {message}")]
    TokenizationFailure { message: String },

    /// Native decode-step error mid-stream
    #[error("Generation failure: {message}")]
    GenerationFailure { message: String },

    /// Concurrent-memory check failed; workloads must be serialized
    #[error("Memory budget exceeded: {message}")]
    BudgetExceeded { message: String },

    /// Invalid sampling parameters or request shape
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Create a load failure
    pub fn load(message: impl Into<String>) -> Self {
        Self::LoadFailure {
            message: message.into(),
        }
    }

    /// Create a context init failure
    pub fn context_init(message: impl Into<String>) -> Self {
        Self::ContextInitFailure {
            message: message.into(),
        }
    }

    /// Create a tokenization failure
    pub fn tokenization(message: impl Into<String>) -> Self {
        Self::TokenizationFailure {
            message: message.into(),
        }
    }

    /// Create a generation failure
    pub fn generation(message: impl Into<String>) -> Self {
        Self::GenerationFailure {
            message: message.into(),
        }
    }

    /// Create a budget-exceeded error
    pub fn budget(message: impl Into<String>) -> Self {
        Self::BudgetExceeded {
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Errors the caller may retry against the same execution context.
    ///
    /// A generation failure discards only the in-flight session; the context
    /// stays valid, so a retry does not require a reload.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::GenerationFailure { .. })
    }

    /// Errors that mean the caller should fall back to serialized execution
    /// rather than treating the condition as fatal.
    pub fn is_budget(&self) -> bool {
        matches!(self, Self::BudgetExceeded { .. })
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = EngineError::load("model file missing");
        assert!(error.to_string().contains("model file missing"));

        let error = EngineError::tokenization("prompt too long");
        assert!(error.to_string().contains("prompt too long"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::generation("decode step failed").is_retryable());
        assert!(!EngineError::load("bad file").is_retryable());
        assert!(!EngineError::context_init("window too large").is_retryable());
    }

    #[test]
    fn test_budget_classification() {
        assert!(EngineError::budget("5 GB over 4 GB ceiling").is_budget());
        assert!(!EngineError::generation("oops").is_budget());
    }

    #[test]
    fn test_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: EngineError = io_err.into();
        assert!(matches!(err, EngineError::Io { .. }));
    }
}
