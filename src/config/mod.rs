//! Configuration resolved from built-in defaults, an optional TOML file and
//! `THROWAWAY_*` environment variables, in increasing order of precedence.

mod engine;
mod helpers;
mod reaper;
mod settings;
mod wait;

use std::time::Duration;

pub use engine::EngineConfig;
pub use reaper::{DEFAULT_REAPER_IMAGE, ReaperConfig};
pub use settings::{CONFIG_FILE_NAME, Settings};
pub use wait::WaitDefaults;

use crate::config::helpers::parse_optional_env;
use crate::error::ConfigError;

/// Lifecycle settings.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleConfig {
    /// Grace period given to a container between stop and kill.
    pub stop_grace: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(10),
        }
    }
}

impl LifecycleConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            stop_grace: Duration::from_secs(parse_optional_env(
                "THROWAWAY_STOP_GRACE_SECS",
                settings
                    .lifecycle
                    .stop_grace_secs
                    .unwrap_or(Self::default().stop_grace.as_secs()),
            )?),
        })
    }
}

/// Full configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub engine: EngineConfig,
    pub reaper: ReaperConfig,
    pub wait: WaitDefaults,
    pub lifecycle: LifecycleConfig,
}

impl Config {
    /// Load the config file (if any) and apply environment overrides.
    pub fn resolve() -> Result<Self, ConfigError> {
        let settings = Settings::load()?;
        Self::from_settings(&settings)
    }

    /// Apply environment overrides on top of already-loaded file settings.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            engine: EngineConfig::resolve(settings)?,
            reaper: ReaperConfig::resolve(settings)?,
            wait: WaitDefaults::resolve(settings)?,
            lifecycle: LifecycleConfig::resolve(settings)?,
        })
    }
}
