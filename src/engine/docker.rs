//! [`Engine`] implementation over the Docker API using `bollard`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, NetworkingConfig, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, ContainerStateStatusEnum, EndpointSettings, HealthStatusEnum,
    HostConfig, Mount as DockerMount, MountTypeEnum,
};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, InspectNetworkOptions, ListNetworksOptions,
};
use bollard::{API_DEFAULT_VERSION, Docker};
use bytes::Bytes;
use futures::StreamExt;

use crate::config::EngineConfig;
use crate::engine::{
    ContainerInspect, ContainerPort, ContainerSpec, ContainerStatus, Engine, ExecOutput,
    HealthStatus, LogChunk, LogFrame, LogStream, MountKind, NetworkAttachment, NetworkSpec,
    PortBinding, Result,
};
use crate::error::EngineError;
use crate::reaper::protocol::FilterSet;

/// Seconds bollard waits on a single request before giving up.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Docker-backed engine.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
    host: String,
}

impl DockerEngine {
    /// Connect using `config`, falling back to the platform default socket.
    pub async fn connect(config: &EngineConfig) -> Result<Self> {
        let docker = connect_docker(config.docker_host.as_deref()).await?;
        let host = config
            .docker_host
            .as_deref()
            .and_then(daemon_host)
            .unwrap_or_else(|| "localhost".to_string());

        let version = docker
            .version()
            .await
            .map_err(|e| EngineError::Unavailable {
                reason: e.to_string(),
            })?;
        tracing::debug!(
            version = %version.version.unwrap_or_default(),
            host = %host,
            "Connected to Docker daemon"
        );

        Ok(Self { docker, host })
    }

    /// Wrap an existing client.
    pub fn from_client(docker: Docker, host: impl Into<String>) -> Self {
        Self {
            docker,
            host: host.into(),
        }
    }

    pub fn client(&self) -> &Docker {
        &self.docker
    }
}

/// Connect to Docker, trying an explicit endpoint first, then bollard's
/// defaults (which honour `DOCKER_HOST`), then rootless and Desktop sockets.
pub async fn connect_docker(endpoint: Option<&str>) -> Result<Docker> {
    if let Some(endpoint) = endpoint {
        let docker = if let Some(path) = endpoint.strip_prefix("unix://") {
            Docker::connect_with_socket(path, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_http(endpoint, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)
        }
        .map_err(|e| EngineError::Unavailable {
            reason: format!("{endpoint}: {e}"),
        })?;
        return ping(docker).await;
    }

    let mut last_error = match Docker::connect_with_local_defaults() {
        Ok(docker) => match ping(docker).await {
            Ok(docker) => return Ok(docker),
            Err(e) => e.to_string(),
        },
        Err(e) => e.to_string(),
    };

    for socket in fallback_sockets() {
        if !socket.exists() {
            continue;
        }
        let path = socket.to_string_lossy().to_string();
        match Docker::connect_with_socket(&path, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION) {
            Ok(docker) => match ping(docker).await {
                Ok(docker) => {
                    tracing::debug!(socket = %path, "Using fallback Docker socket");
                    return Ok(docker);
                }
                Err(e) => last_error = e.to_string(),
            },
            Err(e) => last_error = e.to_string(),
        }
    }

    Err(EngineError::Unavailable { reason: last_error })
}

async fn ping(docker: Docker) -> Result<Docker> {
    docker
        .ping()
        .await
        .map_err(|e| EngineError::Unavailable {
            reason: e.to_string(),
        })?;
    Ok(docker)
}

fn fallback_sockets() -> Vec<PathBuf> {
    let mut sockets = Vec::new();
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        sockets.push(PathBuf::from(runtime_dir).join("docker.sock"));
    }
    if let Some(home) = dirs::home_dir() {
        sockets.push(home.join(".docker/run/docker.sock"));
        sockets.push(home.join(".docker/desktop/docker.sock"));
    }
    sockets
}

/// Host part of a `tcp://host:port` endpoint; `None` for local sockets.
fn daemon_host(endpoint: &str) -> Option<String> {
    let url = url::Url::parse(endpoint).ok()?;
    match url.scheme() {
        "tcp" | "http" | "https" => url.host_str().map(str::to_string),
        _ => None,
    }
}

fn map_err(operation: &'static str, id: &str, err: bollard::errors::Error) -> EngineError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound { id: id.to_string() },
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => EngineError::Conflict {
            id: id.to_string(),
            reason: message,
        },
        other => EngineError::api(operation, other),
    }
}

fn status_from(status: Option<ContainerStateStatusEnum>) -> ContainerStatus {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
        Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
        Some(ContainerStateStatusEnum::PAUSED) => ContainerStatus::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => ContainerStatus::Restarting,
        Some(ContainerStateStatusEnum::REMOVING) => ContainerStatus::Removing,
        Some(ContainerStateStatusEnum::EXITED) => ContainerStatus::Exited,
        Some(ContainerStateStatusEnum::DEAD) => ContainerStatus::Dead,
        _ => ContainerStatus::Unknown,
    }
}

fn inspect_from(response: ContainerInspectResponse) -> ContainerInspect {
    let state = response.state.unwrap_or_default();
    let health = state
        .health
        .and_then(|h| h.status)
        .and_then(|status| match status {
            HealthStatusEnum::STARTING => Some(HealthStatus::Starting),
            HealthStatusEnum::HEALTHY => Some(HealthStatus::Healthy),
            HealthStatusEnum::UNHEALTHY => Some(HealthStatus::Unhealthy),
            _ => None,
        });

    let network_settings = response.network_settings.unwrap_or_default();
    let mut ports = HashMap::new();
    for (key, bindings) in network_settings.ports.unwrap_or_default() {
        let Ok(port) = key.parse::<ContainerPort>() else {
            continue;
        };
        let bindings = bindings
            .unwrap_or_default()
            .into_iter()
            .filter_map(|b| {
                Some(PortBinding {
                    host_ip: b.host_ip.unwrap_or_default(),
                    host_port: b.host_port?.parse().ok()?,
                })
            })
            .collect();
        ports.insert(port, bindings);
    }

    let networks = network_settings
        .networks
        .unwrap_or_default()
        .into_iter()
        .map(|(name, endpoint)| {
            (
                name,
                NetworkAttachment {
                    ip_address: endpoint.ip_address.filter(|ip| !ip.is_empty()),
                    aliases: endpoint.aliases.unwrap_or_default(),
                },
            )
        })
        .collect();

    let host_network = response
        .host_config
        .and_then(|hc| hc.network_mode)
        .is_some_and(|mode| mode == "host");

    ContainerInspect {
        id: response.id.unwrap_or_default(),
        name: response.name,
        status: status_from(state.status),
        exit_code: state.exit_code,
        health,
        ports,
        networks,
        labels: response
            .config
            .and_then(|c| c.labels)
            .unwrap_or_default()
            .into_iter()
            .collect(),
        host_network,
    }
}

/// Drop the first `offset` bytes of `frames`. Returns `None` when the log is
/// shorter than `offset` (rotated or truncated).
fn skip_bytes(frames: Vec<LogFrame>, offset: u64) -> Option<Vec<LogFrame>> {
    let mut remaining = offset;
    let mut out = Vec::new();
    for frame in frames {
        let len = frame.data.len() as u64;
        if remaining >= len {
            remaining -= len;
            continue;
        }
        out.push(LogFrame {
            stream: frame.stream,
            data: frame.data.slice(remaining as usize..),
        });
        remaining = 0;
    }
    (remaining == 0).then_some(out)
}

/// Build a single-entry tar archive holding `contents` at `path`.
fn tar_single_file(path: &str, contents: &[u8], mode: u32) -> std::io::Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(mode);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, path.trim_start_matches('/'), contents)?;
    builder.into_inner()
}

#[async_trait]
impl Engine for DockerEngine {
    async fn host(&self) -> Result<String> {
        Ok(self.host.clone())
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            tracing::debug!("Image '{}' exists locally", image);
            return Ok(());
        }

        tracing::info!("Pulling image: {}", image);
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::trace!("Pull status: {}", status);
                    }
                }
                Err(e) => return Err(map_err("pull", image, e)),
            }
        }
        tracing::info!("Pulled image: {}", image);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .exposed_ports
            .iter()
            .map(|p| (p.to_string(), HashMap::new()))
            .collect();

        let mounts: Vec<DockerMount> = spec
            .mounts
            .iter()
            .map(|m| DockerMount {
                target: Some(m.target.clone()),
                source: (m.kind != MountKind::Tmpfs).then(|| m.source.clone()),
                typ: Some(match m.kind {
                    MountKind::Bind => MountTypeEnum::BIND,
                    MountKind::Volume => MountTypeEnum::VOLUME,
                    MountKind::Tmpfs => MountTypeEnum::TMPFS,
                }),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        // The create call attaches a single network; the rest are connected afterwards.
        let mut networks = spec.networks.iter();
        let first_network = networks.next();

        let host_config = HostConfig {
            publish_all_ports: Some(!spec.exposed_ports.is_empty()),
            mounts: (!mounts.is_empty()).then_some(mounts),
            privileged: Some(spec.privileged),
            auto_remove: Some(spec.auto_remove),
            network_mode: first_network.map(|(name, _)| name.clone()),
            ..Default::default()
        };

        let networking_config = first_network.map(|(name, aliases)| NetworkingConfig {
            endpoints_config: HashMap::from([(
                name.clone(),
                EndpointSettings {
                    aliases: (!aliases.is_empty()).then(|| aliases.clone()),
                    ..Default::default()
                },
            )]),
        });

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
            entrypoint: (!spec.entrypoint.is_empty()).then(|| spec.entrypoint.clone()),
            env: (!env.is_empty()).then_some(env),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            labels: Some(spec.labels.clone().into_iter().collect()),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        let response = self
            .docker
            .create_container(options, config)
            .await
            .map_err(|e| map_err("create_container", &spec.image, e))?;

        for (name, aliases) in networks {
            self.docker
                .connect_network(
                    name,
                    ConnectNetworkOptions {
                        container: response.id.clone(),
                        endpoint_config: EndpointSettings {
                            aliases: (!aliases.is_empty()).then(|| aliases.clone()),
                            ..Default::default()
                        },
                    },
                )
                .await
                .map_err(|e| map_err("connect_network", name, e))?;
        }

        tracing::debug!(container_id = %response.id, image = %spec.image, "Created container");
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_err("start_container", id, e))
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_err("stop_container", id, e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| map_err("remove_container", id, e))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect> {
        self.docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map(inspect_from)
            .map_err(|e| map_err("inspect_container", id, e))
    }

    async fn logs(&self, id: &str, since_offset: u64) -> Result<LogChunk> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut frames = Vec::new();
        while let Some(item) = stream.next().await {
            let frame = match item.map_err(|e| map_err("logs", id, e))? {
                LogOutput::StdErr { message } => LogFrame {
                    stream: LogStream::Stderr,
                    data: message,
                },
                LogOutput::StdOut { message } | LogOutput::Console { message } => LogFrame {
                    stream: LogStream::Stdout,
                    data: message,
                },
                LogOutput::StdIn { .. } => continue,
            };
            frames.push(frame);
        }

        Ok(match skip_bytes(frames.clone(), since_offset) {
            Some(frames) => LogChunk {
                offset: since_offset,
                frames,
            },
            None => LogChunk { offset: 0, frames },
        })
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_err("create_exec", id, e))?;

        let mut out = ExecOutput::default();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| map_err("start_exec", id, e))?
        {
            while let Some(msg) = output.next().await {
                match msg {
                    Ok(LogOutput::StdErr { message }) => {
                        out.stderr.push_str(&String::from_utf8_lossy(&message))
                    }
                    Ok(other) => out.stdout.push_str(&other.to_string()),
                    Err(e) => tracing::warn!("Error reading exec output: {}", e),
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| map_err("inspect_exec", id, e))?;
        out.exit_code = inspect.exit_code.unwrap_or(-1);
        Ok(out)
    }

    async fn copy_to_container(
        &self,
        id: &str,
        path: &str,
        contents: Bytes,
        mode: u32,
    ) -> Result<()> {
        let archive = tar_single_file(path, &contents, mode)?;
        self.docker
            .upload_to_container(
                id,
                Some(UploadToContainerOptions {
                    path: "/".to_string(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .map_err(|e| map_err("copy_to_container", id, e))
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String> {
        let options = CreateNetworkOptions {
            name: spec.name.clone(),
            driver: spec.driver.clone().unwrap_or_else(|| "bridge".to_string()),
            internal: spec.internal,
            labels: spec.labels.clone().into_iter().collect(),
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .map_err(|e| map_err("create_network", &spec.name, e))?;

        let network = self
            .docker
            .inspect_network(&spec.name, None::<InspectNetworkOptions<String>>)
            .await
            .map_err(|e| map_err("inspect_network", &spec.name, e))?;
        network.id.ok_or_else(|| EngineError::NotFound {
            id: spec.name.clone(),
        })
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        self.docker
            .remove_network(id)
            .await
            .map_err(|e| map_err("remove_network", id, e))
    }

    async fn list_containers(&self, filters: &FilterSet) -> Result<Vec<String>> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: filters.by_key(),
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| EngineError::api("list_containers", e))?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn list_networks(&self, filters: &FilterSet) -> Result<Vec<String>> {
        let options = ListNetworksOptions::<String> {
            filters: filters.by_key(),
        };
        let networks = self
            .docker
            .list_networks(Some(options))
            .await
            .map_err(|e| EngineError::api("list_networks", e))?;
        Ok(networks.into_iter().filter_map(|n| n.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(data: &'static [u8]) -> LogFrame {
        LogFrame {
            stream: LogStream::Stdout,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn test_daemon_host_from_endpoint() {
        assert_eq!(daemon_host("tcp://10.0.0.5:2375"), Some("10.0.0.5".to_string()));
        assert_eq!(daemon_host("unix:///var/run/docker.sock"), None);
        assert_eq!(daemon_host("not a url"), None);
    }

    #[test]
    fn test_skip_bytes_across_frames() {
        let frames = vec![frame(b"hello "), frame(b"world")];
        let rest = skip_bytes(frames, 8).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].data, Bytes::from_static(b"rld"));
    }

    #[test]
    fn test_skip_bytes_detects_rotation() {
        assert!(skip_bytes(vec![frame(b"abc")], 10).is_none());
        assert_eq!(skip_bytes(vec![frame(b"abc")], 3).unwrap().len(), 0);
    }

    #[test]
    fn test_tar_single_file_layout() {
        let archive = tar_single_file("/etc/app/config.toml", b"key = 1", 0o644).unwrap();
        let mut reader = tar::Archive::new(archive.as_slice());
        let entries: Vec<_> = reader
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["etc/app/config.toml".to_string()]);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_from(Some(ContainerStateStatusEnum::EXITED)),
            ContainerStatus::Exited
        );
        assert_eq!(status_from(None), ContainerStatus::Unknown);
    }
}
