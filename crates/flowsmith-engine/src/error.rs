//! Engine error types.
//!
//! All engine operations surface errors through [`EngineError`]. Integration
//! failures during a run are not errors: they are recorded as node outcomes
//! in the execution report.

use flowsmith_store::StoreError;

use crate::flow::Flow;
use crate::validator::ValidationResult;

/// Unified error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // -- Caller errors -------------------------------------------------------
    /// The request itself is malformed (empty prompt, cadence below one
    /// minute, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The flow has hard validation errors and cannot be persisted or run.
    #[error("flow rejected by validation (score {}): {}", validation.score, validation.errors.join("; "))]
    ValidationRejected {
        flow: Box<Flow>,
        validation: ValidationResult,
    },

    /// The addressed record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// An integration the flow needs has no credentials configured.
    #[error("integration `{integration}` is missing credentials: {}", keys.join(", "))]
    MissingCredentials {
        integration: String,
        keys: Vec<String>,
    },

    // -- Recovered internally ------------------------------------------------
    /// The language model could not be used. The interpreter always falls
    /// back to keyword classification when it sees this.
    #[error("language model unavailable: {0}")]
    ModelUnavailable(String),

    // -- Upstream ------------------------------------------------------------
    /// Storage failed.
    #[error("persistence error: {0}")]
    Persistence(StoreError),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // -- Generic -------------------------------------------------------------
    #[error("internal engine error: {0}")]
    Internal(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            other => Self::Persistence(other),
        }
    }
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Convenience alias used throughout the engine crate.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_not_found() {
        let err: EngineError = StoreError::NotFound {
            entity: "automation",
            id: "a1".into(),
        }
        .into();
        assert!(matches!(err, EngineError::NotFound { entity: "automation", .. }));
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "automation not found: a1");
    }

    #[test]
    fn other_store_errors_are_persistence() {
        let err: EngineError = StoreError::InvalidArgument("bad".into()).into();
        assert!(matches!(err, EngineError::Persistence(_)));
        assert!(!err.is_not_found());
    }
}
