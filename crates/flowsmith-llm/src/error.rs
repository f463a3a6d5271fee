//! Error types for the language-model client.

/// Errors produced while talking to a language-model provider.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// The HTTP request failed or the provider returned a non-success status.
    #[error("LLM request failed: {reason}")]
    RequestFailed { reason: String },

    /// The provider answered, but the body was not in the expected shape.
    #[error("failed to parse LLM response: {reason}")]
    ParseFailed { reason: String },

    /// No API key was configured for the provider.
    #[error("missing API key for provider `{provider}`")]
    MissingApiKey { provider: String },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LlmError>;
