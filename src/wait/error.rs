//! Error types for readiness waiting.

use std::time::Duration;

use thiserror::Error;

/// Result type for readiness checks.
pub type Result<T> = std::result::Result<T, WaitError>;

/// Outcome of a single failed probe, classified by the strategy that ran it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// The resource is not ready yet; the driver keeps polling.
    #[error("{0}")]
    Transient(String),

    /// The strategy can never succeed (misconfiguration, resource gone).
    #[error("{0}")]
    Fatal(String),
}

impl ProbeError {
    pub fn transient(reason: impl ToString) -> Self {
        ProbeError::Transient(reason.to_string())
    }

    pub fn fatal(reason: impl ToString) -> Self {
        ProbeError::Fatal(reason.to_string())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ProbeError::Fatal(_))
    }
}

/// Why a readiness check did not succeed.
#[derive(Debug, Error)]
pub enum WaitError {
    /// The strategy did not succeed before its deadline.
    #[error(
        "Strategy {strategy} not ready after {elapsed:?}{}",
        last_error_suffix(.last_error)
    )]
    Timeout {
        /// Name of the strategy that timed out.
        strategy: String,
        /// Time spent polling.
        elapsed: Duration,
        /// Last transient failure observed, if any.
        last_error: Option<String>,
    },

    /// The strategy reported an error that polling cannot fix.
    #[error("Strategy {strategy} failed after {elapsed:?}: {source}")]
    Fatal {
        /// Name of the failing strategy.
        strategy: String,
        /// Time spent before the failure.
        elapsed: Duration,
        /// The probe failure.
        source: ProbeError,
    },

    /// The caller cancelled the wait.
    #[error("Strategy {strategy} cancelled after {elapsed:?}")]
    Cancelled {
        /// Name of the strategy being waited on.
        strategy: String,
        /// Time spent before cancellation.
        elapsed: Duration,
    },

    /// One or more children of an ALL combinator failed.
    #[error("{} of the combined strategies failed: {}", .failures.len(), join_failures(.failures))]
    All {
        /// Every failing child, in completion order.
        failures: Vec<WaitError>,
    },
}

impl WaitError {
    /// Names of the strategies responsible for this error.
    pub fn failed_strategies(&self) -> Vec<&str> {
        match self {
            WaitError::Timeout { strategy, .. }
            | WaitError::Fatal { strategy, .. }
            | WaitError::Cancelled { strategy, .. } => vec![strategy.as_str()],
            WaitError::All { failures } => failures
                .iter()
                .flat_map(WaitError::failed_strategies)
                .collect(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, WaitError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, WaitError::Cancelled { .. })
    }
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(e) => format!(" (last error: {e})"),
        None => String::new(),
    }
}

fn join_failures(failures: &[WaitError]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_includes_diagnostics() {
        let err = WaitError::Timeout {
            strategy: "port(5432/tcp)".to_string(),
            elapsed: Duration::from_secs(5),
            last_error: Some("connection refused".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("port(5432/tcp)"));
        assert!(msg.contains("5s"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_all_lists_every_child() {
        let err = WaitError::All {
            failures: vec![
                WaitError::Timeout {
                    strategy: "log(\"ready\")".to_string(),
                    elapsed: Duration::from_secs(1),
                    last_error: None,
                },
                WaitError::Fatal {
                    strategy: "healthcheck".to_string(),
                    elapsed: Duration::ZERO,
                    source: ProbeError::fatal("no health check configured"),
                },
            ],
        };
        assert_eq!(err.failed_strategies(), vec!["log(\"ready\")", "healthcheck"]);
        assert!(err.to_string().starts_with("2 of the combined strategies failed"));
    }
}
