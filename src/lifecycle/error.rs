//! Error types for the lifecycle pipeline.

use std::fmt;

use thiserror::Error;

use crate::error::{ConfigError, EngineError};
use crate::lifecycle::handle::ResourceHandle;
use crate::reaper::ReaperError;
use crate::wait::WaitError;

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Hook phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    PreCreate,
    PostCreate,
    PreStart,
    PostStart,
    PreTerminate,
    PostTerminate,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::PreCreate => "pre-create",
            Phase::PostCreate => "post-create",
            Phase::PreStart => "pre-start",
            Phase::PostStart => "post-start",
            Phase::PreTerminate => "pre-terminate",
            Phase::PostTerminate => "post-terminate",
        };
        f.write_str(s)
    }
}

/// A failed engine call during termination. Not fatal: the reaper still
/// removes the resource once the session ends.
#[derive(Debug, Error)]
#[error("Failed to terminate {resource_id}: {source}")]
pub struct TerminationError {
    /// Container or network that could not be removed.
    pub resource_id: String,
    /// Underlying engine failure.
    pub source: EngineError,
}

/// Errors from create / start / terminate.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// A hook failed; later hooks in the phase did not run.
    #[error("{phase} hook #{index} failed: {source}")]
    Hook {
        /// Phase the hook belongs to.
        phase: Phase,
        /// Position of the hook within the phase, defaults included.
        index: usize,
        /// What the hook returned.
        source: anyhow::Error,
        /// The resource, if it had already been created.
        handle: Option<Box<ResourceHandle>>,
    },

    /// An engine call outside of any hook failed.
    #[error("Engine call {operation} failed: {source}")]
    Engine {
        /// Which lifecycle step made the call.
        operation: &'static str,
        /// Engine failure.
        source: EngineError,
        /// The resource, if it had already been created.
        handle: Option<Box<ResourceHandle>>,
    },

    /// Reaper registration failed and the configuration requires it.
    #[error(transparent)]
    Reaper(#[from] ReaperError),

    /// The request was invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Termination(#[from] TerminationError),
}

impl LifecycleError {
    /// The partially created resource, so it can still be inspected or
    /// terminated.
    pub fn handle(&self) -> Option<&ResourceHandle> {
        match self {
            LifecycleError::Hook { handle, .. } | LifecycleError::Engine { handle, .. } => {
                handle.as_deref()
            }
            _ => None,
        }
    }

    pub fn into_handle(self) -> Option<ResourceHandle> {
        match self {
            LifecycleError::Hook { handle, .. } | LifecycleError::Engine { handle, .. } => {
                handle.map(|h| *h)
            }
            _ => None,
        }
    }

    /// The readiness failure, when this error came from waiting.
    pub fn wait_error(&self) -> Option<&WaitError> {
        match self {
            LifecycleError::Hook { source, .. } => source.downcast_ref::<WaitError>(),
            _ => None,
        }
    }

    pub(crate) fn attach(self, h: ResourceHandle) -> Self {
        match self {
            LifecycleError::Hook {
                phase,
                index,
                source,
                handle: None,
            } => LifecycleError::Hook {
                phase,
                index,
                source,
                handle: Some(Box::new(h)),
            },
            LifecycleError::Engine {
                operation,
                source,
                handle: None,
            } => LifecycleError::Engine {
                operation,
                source,
                handle: Some(Box::new(h)),
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_error_names_phase_and_index() {
        let err = LifecycleError::Hook {
            phase: Phase::PostCreate,
            index: 2,
            source: anyhow::anyhow!("copy failed"),
            handle: None,
        };
        assert_eq!(err.to_string(), "post-create hook #2 failed: copy failed");
        assert!(err.handle().is_none());
    }
}
