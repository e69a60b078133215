use crate::config::helpers::optional_env;
use crate::config::settings::Settings;
use crate::error::ConfigError;

/// How to reach the container engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Explicit engine endpoint (`unix:///…` or `tcp://host:port`). `None`
    /// uses the platform default socket.
    pub docker_host: Option<String>,
    /// Prepended to every image reference, e.g. a registry mirror.
    pub hub_image_prefix: Option<String>,
}

impl EngineConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let docker_host = match optional_env("THROWAWAY_DOCKER_HOST")? {
            Some(host) => Some(host),
            None => optional_env("DOCKER_HOST")?.or_else(|| settings.engine.docker_host.clone()),
        };

        Ok(Self {
            docker_host,
            hub_image_prefix: optional_env("THROWAWAY_HUB_IMAGE_PREFIX")?
                .or_else(|| settings.engine.hub_image_prefix.clone()),
        })
    }

    /// Apply the hub prefix to `image`, leaving fully qualified references
    /// (those with a registry host) untouched.
    pub fn image_name(&self, image: &str) -> String {
        let Some(prefix) = self.hub_image_prefix.as_deref() else {
            return image.to_string();
        };
        let has_registry = image
            .split_once('/')
            .is_some_and(|(first, _)| first.contains('.') || first.contains(':') || first == "localhost");
        if has_registry {
            image.to_string()
        } else {
            format!("{}/{}", prefix.trim_end_matches('/'), image)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_name_prefix() {
        let config = EngineConfig {
            docker_host: None,
            hub_image_prefix: Some("mirror.local/".to_string()),
        };
        assert_eq!(config.image_name("postgres:16"), "mirror.local/postgres:16");
        assert_eq!(config.image_name("ghcr.io/x/y:1"), "ghcr.io/x/y:1");
        assert_eq!(EngineConfig::default().image_name("redis"), "redis");
    }
}
