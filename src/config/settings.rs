use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::helpers::optional_env;
use crate::error::ConfigError;

/// Name of the per-user config file looked up in the home directory.
pub const CONFIG_FILE_NAME: &str = ".throwaway.toml";

/// Values read from the TOML config file. Every field is optional; unset
/// fields fall through to built-in defaults, and environment variables
/// override both.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub reaper: ReaperSettings,
    pub wait: WaitSettings,
    pub lifecycle: LifecycleSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub docker_host: Option<String>,
    pub hub_image_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReaperSettings {
    pub disabled: Option<bool>,
    pub required: Option<bool>,
    pub image: Option<String>,
    pub privileged: Option<bool>,
    pub port: Option<u16>,
    pub connect_attempts: Option<u32>,
    pub connect_backoff_ms: Option<u64>,
    pub connection_timeout_secs: Option<u64>,
    pub reconnection_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WaitSettings {
    pub startup_timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    pub stop_grace_secs: Option<u64>,
}

impl Settings {
    /// Load from `$THROWAWAY_CONFIG`, else `~/.throwaway.toml`. A missing file
    /// yields empty settings; an unreadable or malformed one is an error.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path()? {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn default_path() -> Result<Option<PathBuf>, ConfigError> {
        if let Some(path) = optional_env("THROWAWAY_CONFIG")? {
            return Ok(Some(PathBuf::from(path)));
        }
        Ok(dirs::home_dir().map(|home| home.join(CONFIG_FILE_NAME)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[reaper]\nrequired = true\nport = 9090\n\n[wait]\npoll_interval_ms = 250"
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.reaper.required, Some(true));
        assert_eq!(settings.reaper.port, Some(9090));
        assert_eq!(settings.wait.poll_interval_ms, Some(250));
        assert_eq!(settings.engine.docker_host, None);
    }

    #[test]
    fn test_malformed_file_names_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[reaper\nport = ").unwrap();

        let err = Settings::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::File { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }
}
