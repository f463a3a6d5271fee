//! Adapter error types.
//!
//! Every integration surfaces failures through [`AdapterError`]. The
//! executor uses [`AdapterError::is_retryable`] to decide whether a failed
//! call is worth a second attempt.

/// Unified error type for Flowsmith integrations.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// An I/O operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The request is missing data the integration needs.
    #[error("invalid parameters for `{integration}`: {reason}")]
    InvalidParams { integration: String, reason: String },

    /// The remote service call failed.
    #[error("`{integration}` call failed: {reason}")]
    ExecutionFailed { integration: String, reason: String },

    /// Credentials for the integration are not configured.
    #[error("`{integration}` is missing credentials: {}", keys.join(", "))]
    MissingCredentials {
        integration: String,
        keys: Vec<String>,
    },

    /// The integration was asked to perform an action it does not provide.
    #[error("`{integration}` does not support {capability}")]
    Unsupported {
        integration: String,
        capability: String,
    },

    /// No integration is registered under the requested name.
    #[error("no integration registered as `{integration}`")]
    NotRegistered { integration: String },

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation exceeded its time limit.
    #[error("timeout after {seconds}s: {reason}")]
    Timeout { seconds: u64, reason: String },

    /// The integration was built with an unusable configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl AdapterError {
    /// Whether repeating the same call could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ExecutionFailed { .. } | Self::Timeout { .. }
        )
    }
}

/// Convenience alias used throughout the adapters crate.
pub type Result<T> = std::result::Result<T, AdapterError>;
