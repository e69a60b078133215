use std::time::Duration;

use crate::config::helpers::parse_optional_env;
use crate::config::settings::Settings;
use crate::error::ConfigError;

/// Timeout and poll interval applied to wait strategies that do not set
/// their own. Passed explicitly to every readiness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitDefaults {
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitDefaults {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl WaitDefaults {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let poll_interval_ms = parse_optional_env(
            "THROWAWAY_WAIT_POLL_INTERVAL_MS",
            settings
                .wait
                .poll_interval_ms
                .unwrap_or(defaults.poll_interval.as_millis() as u64),
        )?;
        if poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "THROWAWAY_WAIT_POLL_INTERVAL_MS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            startup_timeout: Duration::from_secs(parse_optional_env(
                "THROWAWAY_WAIT_TIMEOUT_SECS",
                settings
                    .wait
                    .startup_timeout_secs
                    .unwrap_or(defaults.startup_timeout.as_secs()),
            )?),
            poll_interval: Duration::from_millis(poll_interval_ms),
        })
    }
}
