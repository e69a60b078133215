//! What the caller wants created.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::engine::{ContainerPort, ContainerSpec, Mount};
use crate::error::ConfigError;
use crate::lifecycle::hooks::LifecycleHooks;
use crate::lifecycle::logs::LogConsumer;
use crate::session::LABEL_PREFIX;
use crate::wait::WaitSpec;

/// A file written into the container after creation, before start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerFile {
    /// Absolute path inside the container.
    pub path: String,
    pub contents: Bytes,
    pub mode: u32,
}

impl ContainerFile {
    pub fn new(path: impl Into<String>, contents: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
            mode: 0o644,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }
}

/// Desired container plus readiness condition and hooks.
#[derive(Clone, Default)]
pub struct ResourceRequest {
    pub image: String,
    pub name: Option<String>,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub exposed_ports: Vec<ContainerPort>,
    pub mounts: Vec<Mount>,
    /// Network name to aliases.
    pub networks: BTreeMap<String, Vec<String>>,
    pub labels: BTreeMap<String, String>,
    pub files: Vec<ContainerFile>,
    pub wait: Option<WaitSpec>,
    pub hooks: Vec<LifecycleHooks>,
    pub log_consumers: Vec<Arc<dyn LogConsumer>>,
    pub privileged: bool,
    /// Leave this resource out of reaper registration.
    pub skip_reaper: bool,
}

impl std::fmt::Debug for ResourceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRequest")
            .field("image", &self.image)
            .field("name", &self.name)
            .field("exposed_ports", &self.exposed_ports)
            .field("networks", &self.networks)
            .field("wait", &self.wait)
            .field("skip_reaper", &self.skip_reaper)
            .finish_non_exhaustive()
    }
}

/// Single customization step applied to a [`ResourceRequest`].
pub trait Customize {
    fn apply(self, request: &mut ResourceRequest) -> Result<(), ConfigError>;
}

/// The closed set of request customizations.
#[derive(Clone)]
pub enum RequestOption {
    Env(String, String),
    /// A caller label. Labels under the reserved `dev.throwaway` prefix are
    /// rejected.
    Label(String, String),
    ExposedPort(ContainerPort),
    Cmd(Vec<String>),
    Entrypoint(Vec<String>),
    Network { name: String, aliases: Vec<String> },
    Mount(Mount),
    File(ContainerFile),
    Wait(WaitSpec),
    Hooks(LifecycleHooks),
    LogConsumer(Arc<dyn LogConsumer>),
    Name(String),
    Privileged,
    SkipReaper,
}

impl Customize for RequestOption {
    fn apply(self, request: &mut ResourceRequest) -> Result<(), ConfigError> {
        match self {
            RequestOption::Env(k, v) => {
                request.env.insert(k, v);
            }
            RequestOption::Label(k, v) => {
                if k == LABEL_PREFIX || k.starts_with(&format!("{LABEL_PREFIX}.")) {
                    return Err(ConfigError::InvalidValue {
                        key: k,
                        message: format!("labels under '{LABEL_PREFIX}' are reserved"),
                    });
                }
                request.labels.insert(k, v);
            }
            RequestOption::ExposedPort(port) => {
                if !request.exposed_ports.contains(&port) {
                    request.exposed_ports.push(port);
                }
            }
            RequestOption::Cmd(cmd) => request.cmd = cmd,
            RequestOption::Entrypoint(entrypoint) => request.entrypoint = entrypoint,
            RequestOption::Network { name, aliases } => {
                request.networks.entry(name).or_default().extend(aliases);
            }
            RequestOption::Mount(mount) => request.mounts.push(mount),
            RequestOption::File(file) => {
                if !file.path.starts_with('/') {
                    return Err(ConfigError::InvalidValue {
                        key: "file".to_string(),
                        message: format!("'{}' must be an absolute path", file.path),
                    });
                }
                request.files.push(file);
            }
            RequestOption::Wait(spec) => request.wait = Some(spec),
            RequestOption::Hooks(hooks) => request.hooks.push(hooks),
            RequestOption::LogConsumer(consumer) => request.log_consumers.push(consumer),
            RequestOption::Name(name) => request.name = Some(name),
            RequestOption::Privileged => request.privileged = true,
            RequestOption::SkipReaper => request.skip_reaper = true,
        }
        Ok(())
    }
}

impl ResourceRequest {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Apply options in order; the first invalid one aborts.
    pub fn customize(
        mut self,
        options: impl IntoIterator<Item = RequestOption>,
    ) -> Result<Self, ConfigError> {
        for option in options {
            option.apply(&mut self)?;
        }
        Ok(self)
    }

    pub fn with_exposed_port(mut self, port: impl Into<ContainerPort>) -> Self {
        let port = port.into();
        if !self.exposed_ports.contains(&port) {
            self.exposed_ports.push(port);
        }
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_wait(mut self, spec: impl Into<WaitSpec>) -> Self {
        self.wait = Some(spec.into());
        self
    }

    pub fn with_network(mut self, name: impl Into<String>, aliases: &[&str]) -> Self {
        self.networks
            .entry(name.into())
            .or_default()
            .extend(aliases.iter().map(|a| a.to_string()));
        self
    }

    pub fn with_hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks.push(hooks);
        self
    }

    /// The engine-level description of this request.
    pub(crate) fn to_spec(&self, image: String) -> ContainerSpec {
        ContainerSpec {
            name: self.name.clone(),
            image,
            cmd: self.cmd.clone(),
            entrypoint: self.entrypoint.clone(),
            env: self.env.clone(),
            exposed_ports: self.exposed_ports.clone(),
            mounts: self.mounts.clone(),
            networks: self.networks.clone(),
            labels: self.labels.clone(),
            privileged: self.privileged,
            auto_remove: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_options_apply_in_order() {
        let req = ResourceRequest::new("redis:7")
            .customize([
                RequestOption::Env("A".to_string(), "1".to_string()),
                RequestOption::Env("A".to_string(), "2".to_string()),
                RequestOption::ExposedPort(ContainerPort::tcp(6379)),
                RequestOption::ExposedPort(ContainerPort::tcp(6379)),
                RequestOption::Network {
                    name: "backend".to_string(),
                    aliases: vec!["cache".to_string()],
                },
                RequestOption::SkipReaper,
            ])
            .unwrap();

        assert_eq!(req.env.get("A").map(String::as_str), Some("2"));
        assert_eq!(req.exposed_ports, vec![ContainerPort::tcp(6379)]);
        assert_eq!(req.networks["backend"], vec!["cache".to_string()]);
        assert!(req.skip_reaper);
    }

    #[test]
    fn test_reserved_label_rejected() {
        let err = ResourceRequest::new("redis")
            .customize([RequestOption::Label(
                "dev.throwaway.session-id".to_string(),
                "forged".to_string(),
            )])
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        assert!(
            ResourceRequest::new("redis")
                .customize([RequestOption::Label(
                    "dev.throwawayish".to_string(),
                    "ok".to_string()
                )])
                .is_ok()
        );
    }

    #[test]
    fn test_relative_file_rejected() {
        let result = ResourceRequest::new("redis").customize([RequestOption::File(
            ContainerFile::new("etc/redis.conf", "maxmemory 1mb"),
        )]);
        assert!(result.is_err());
    }
}
