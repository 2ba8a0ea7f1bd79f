//! Error types for gpufleet

use thiserror::Error;

use crate::instance::InstanceState;

/// Main error type for gpufleet
#[derive(Error, Debug)]
pub enum FleetError {
    /// A spec or source field is illegal
    #[error("Validation error: {0}")]
    Validation(String),

    /// An entity with the same unique name already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Operation on an entity that does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// No worker/GPU combination satisfies the resource claim
    #[error("Scheduling error: {0}")]
    Scheduling(String),

    /// Process or launch failure
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// A lifecycle phase exceeded its bound
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Lifecycle transition not permitted by the state machine
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: InstanceState,
        to: InstanceState,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for gpufleet operations
pub type FleetResult<T> = Result<T, FleetError>;

impl FleetError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        FleetError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether the failure is resolved by a later reconciliation pass.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FleetError::Scheduling(_))
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for FleetError {
    fn from(err: toml::de::Error) -> Self {
        FleetError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FleetError::Validation("local_path must be provided".to_string());
        assert_eq!(
            err.to_string(),
            "Validation error: local_path must be provided"
        );

        let err = FleetError::not_found("Model", 42);
        assert_eq!(err.to_string(), "Model not found: 42");

        let err = FleetError::InvalidTransition {
            from: InstanceState::Pending,
            to: InstanceState::Running,
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition: pending -> running"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: FleetError = io_err.into();
        assert!(matches!(err, FleetError::Io(_)));
    }

    #[test]
    fn test_only_scheduling_is_retryable() {
        assert!(FleetError::Scheduling("no capacity".into()).is_retryable());
        assert!(!FleetError::Runtime("spawn failed".into()).is_retryable());
        assert!(!FleetError::Timeout("download".into()).is_retryable());
        assert!(!FleetError::Conflict("dup".into()).is_retryable());
    }
}
