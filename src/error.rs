//! Error types for the triage loop

use thiserror::Error;
use tower::BoxError;

/// Result type alias for the triage crate
pub type Result<T> = std::result::Result<T, TriageError>;

/// Main error type for the triage crate.
///
/// Model-format problems never show up here: the parsers recover from them
/// locally. What remains are transport failures, tool failures, and bad input
/// or configuration supplied by the host.
#[derive(Debug, Error)]
pub enum TriageError {
    /// Error from the OpenAI API
    #[error("OpenAI API error: {0}")]
    OpenAI(#[from] async_openai::error::OpenAIError),

    /// The model answered, but not with anything usable at the transport level
    #[error("Model behavior error: {message}")]
    ModelBehavior { message: String },

    /// A registered tool failed while executing
    #[error("Tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    /// A case document from the host is not a JSON object
    #[error("Invalid case: {message}")]
    InvalidCase { message: String },

    /// Configuration is inconsistent
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Configuration file could not be parsed
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other failure surfaced by a service in the stack
    #[error("{0}")]
    Service(BoxError),
}

impl TriageError {
    /// Recover a typed error from the boxed error a tower service returned.
    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<TriageError>() {
            Ok(typed) => *typed,
            Err(other) => TriageError::Service(other),
        }
    }
}
