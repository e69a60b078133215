use std::time::Duration;

use crate::config::helpers::{optional_env, parse_bool_env, parse_optional_env};
use crate::config::settings::Settings;
use crate::error::ConfigError;

/// Default sidecar image.
pub const DEFAULT_REAPER_IMAGE: &str = "ghcr.io/throwaway/reaper:0.1";

/// Reaper client and sidecar configuration.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Skip the reaper entirely. Resources are then only removed by explicit
    /// termination.
    pub disabled: bool,
    /// Treat an unreachable reaper as an error instead of a warning.
    pub required: bool,
    /// Sidecar image.
    pub image: String,
    /// Run the sidecar privileged (needed for some rootless setups).
    pub privileged: bool,
    /// Port the sidecar listens on inside its container.
    pub port: u16,
    /// How many times the client dials the sidecar before giving up.
    pub connect_attempts: u32,
    /// Delay between dial attempts.
    pub connect_backoff: Duration,
    /// The sidecar exits without pruning if nobody connects within this window.
    pub connection_timeout: Duration,
    /// Grace period after the last client disconnects before pruning.
    pub reconnection_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            required: false,
            image: DEFAULT_REAPER_IMAGE.to_string(),
            privileged: false,
            port: 8080,
            connect_attempts: 5,
            connect_backoff: Duration::from_millis(500),
            connection_timeout: Duration::from_secs(60),
            reconnection_timeout: Duration::from_secs(10),
        }
    }
}

impl ReaperConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let file = &settings.reaper;

        let connect_attempts = parse_optional_env(
            "THROWAWAY_REAPER_CONNECT_ATTEMPTS",
            file.connect_attempts.unwrap_or(defaults.connect_attempts),
        )?;
        if connect_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "THROWAWAY_REAPER_CONNECT_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            disabled: parse_bool_env(
                "THROWAWAY_REAPER_DISABLED",
                file.disabled.unwrap_or(defaults.disabled),
            )?,
            required: parse_bool_env(
                "THROWAWAY_REAPER_REQUIRED",
                file.required.unwrap_or(defaults.required),
            )?,
            image: optional_env("THROWAWAY_REAPER_IMAGE")?
                .or_else(|| file.image.clone())
                .unwrap_or(defaults.image),
            privileged: parse_bool_env(
                "THROWAWAY_REAPER_PRIVILEGED",
                file.privileged.unwrap_or(defaults.privileged),
            )?,
            port: parse_optional_env("THROWAWAY_REAPER_PORT", file.port.unwrap_or(defaults.port))?,
            connect_attempts,
            connect_backoff: Duration::from_millis(parse_optional_env(
                "THROWAWAY_REAPER_CONNECT_BACKOFF_MS",
                file.connect_backoff_ms
                    .unwrap_or(defaults.connect_backoff.as_millis() as u64),
            )?),
            connection_timeout: Duration::from_secs(parse_optional_env(
                "THROWAWAY_REAPER_CONNECTION_TIMEOUT_SECS",
                file.connection_timeout_secs
                    .unwrap_or(defaults.connection_timeout.as_secs()),
            )?),
            reconnection_timeout: Duration::from_secs(parse_optional_env(
                "THROWAWAY_REAPER_RECONNECTION_TIMEOUT_SECS",
                file.reconnection_timeout_secs
                    .unwrap_or(defaults.reconnection_timeout.as_secs()),
            )?),
        })
    }
}
