//! Error types for the reaper client and sidecar.

use thiserror::Error;

use crate::error::EngineError;

/// Result type for reaper operations.
pub type Result<T> = std::result::Result<T, ReaperError>;

/// Errors that can occur while talking to, or running, the reaper.
#[derive(Debug, Error)]
pub enum ReaperError {
    /// The sidecar could not be reached after all connection attempts.
    ///
    /// Resources created while this is outstanding are not crash-safe.
    #[error("Reaper unavailable at {endpoint} after {attempts} attempt(s): {reason}")]
    Unavailable {
        /// Address that was dialled.
        endpoint: String,
        /// How many dials were made.
        attempts: u32,
        /// Last failure.
        reason: String,
    },

    /// The connection to the sidecar dropped after registration.
    #[error("Reaper connection lost: {reason}")]
    ConnectionLost {
        /// Reason for the loss.
        reason: String,
    },

    /// A malformed line or reply.
    #[error("Reaper protocol error: {reason}")]
    Protocol {
        /// What was wrong.
        reason: String,
    },

    /// The sidecar container could not be started or found.
    #[error("Reaper sidecar error: {0}")]
    Engine(#[from] EngineError),

    /// I/O error on the reaper socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
