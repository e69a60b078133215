//! Crate-level error types shared across modules.

use thiserror::Error;

/// Errors raised while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable or config key had an unparseable value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue {
        /// The offending key.
        key: String,
        /// What was wrong with it.
        message: String,
    },

    /// The config file exists but could not be read or parsed.
    #[error("Failed to load config file {path}: {reason}")]
    File {
        /// Path of the config file.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// A request or strategy was assembled with contradictory settings.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors returned by an [`Engine`](crate::engine::Engine) implementation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine endpoint could not be reached.
    #[error("Engine not available: {reason}")]
    Unavailable {
        /// Reason why the engine is unavailable.
        reason: String,
    },

    /// The referenced container or network does not exist.
    #[error("Resource not found: {id}")]
    NotFound {
        /// Identifier that was looked up.
        id: String,
    },

    /// The resource exists but is in a state that does not allow the call
    /// (e.g. exec into a stopped container, removing a network still in use).
    #[error("Resource {id} conflict: {reason}")]
    Conflict {
        /// Identifier of the resource.
        id: String,
        /// Engine-provided reason.
        reason: String,
    },

    /// A container port has no host binding (yet).
    #[error("Port {port} of {id} is not mapped to the host")]
    PortNotMapped {
        /// Container identifier.
        id: String,
        /// Container-side port, e.g. `5432/tcp`.
        port: String,
    },

    /// Any other failure reported by the engine.
    #[error("Engine call {operation} failed: {reason}")]
    Api {
        /// Name of the engine operation.
        operation: &'static str,
        /// Reason for failure.
        reason: String,
    },

    /// I/O error while talking to the engine.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this error means the resource is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
    }

    pub(crate) fn api(operation: &'static str, reason: impl ToString) -> Self {
        EngineError::Api {
            operation,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        assert!(
            EngineError::NotFound {
                id: "abc".to_string()
            }
            .is_not_found()
        );
        assert!(!EngineError::api("start", "boom").is_not_found());
    }

    #[test]
    fn test_error_messages_name_the_resource() {
        let err = EngineError::PortNotMapped {
            id: "c1".to_string(),
            port: "80/tcp".to_string(),
        };
        assert_eq!(err.to_string(), "Port 80/tcp of c1 is not mapped to the host");
    }
}
