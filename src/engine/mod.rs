//! Engine Client Facade.
//!
//! Everything the rest of the crate needs from a container engine, expressed
//! as one object-safe trait. [`docker::DockerEngine`] implements it over the
//! Docker API; [`crate::testing::FakeEngine`] implements it in memory.
//!
//! ```text
//!   Provider / wait strategies / reaper
//!                  │
//!                  ▼
//!          ┌───────────────┐
//!          │ dyn Engine    │  create · start · stop · remove · inspect
//!          │               │  logs(since) · exec · copy · networks · list
//!          └───────┬───────┘
//!                  │
//!        ┌─────────┴─────────┐
//!        ▼                   ▼
//!   DockerEngine        FakeEngine
//! ```

pub mod docker;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{ConfigError, EngineError};
use crate::reaper::protocol::FilterSet;

pub use docker::DockerEngine;

/// Result type for engine calls.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Transport protocol of a container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// A container-side port such as `5432/tcp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerPort {
    pub port: u16,
    pub protocol: Protocol,
}

impl ContainerPort {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Udp,
        }
    }
}

impl fmt::Display for ContainerPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol.as_str())
    }
}

impl FromStr for ContainerPort {
    type Err = ConfigError;

    /// Parses `8080`, `8080/tcp` or `53/udp`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (port, proto) = s.split_once('/').unwrap_or((s, "tcp"));
        let port = port.trim().parse::<u16>().map_err(|e| ConfigError::InvalidValue {
            key: "port".to_string(),
            message: format!("'{s}' is not a valid port: {e}"),
        })?;
        let protocol = match proto.trim().to_ascii_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "port".to_string(),
                    message: format!("unsupported protocol '{other}'"),
                });
            }
        };
        Ok(Self { port, protocol })
    }
}

impl From<u16> for ContainerPort {
    fn from(port: u16) -> Self {
        Self::tcp(port)
    }
}

/// Kind of mount attached to a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountKind {
    /// Host path bind mount.
    Bind,
    /// Named engine volume.
    Volume,
    /// In-memory filesystem.
    Tmpfs,
}

/// A mount requested for a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub kind: MountKind,
    /// Host path or volume name; ignored for tmpfs.
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Bind,
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn volume(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Volume,
            source: name.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Everything the engine needs to create a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: Option<String>,
    pub image: String,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub exposed_ports: Vec<ContainerPort>,
    pub mounts: Vec<Mount>,
    /// Networks to attach to, with their aliases.
    pub networks: BTreeMap<String, Vec<String>>,
    pub labels: BTreeMap<String, String>,
    pub privileged: bool,
    pub auto_remove: bool,
}

/// Engine-reported container status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerStatus {
    /// Whether the main process has terminated for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerStatus::Exited | ContainerStatus::Dead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Unknown => "unknown",
        }
    }
}

/// Engine health-check status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

/// A host binding of a container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: u16,
}

/// A container's attachment to a network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub ip_address: Option<String>,
    pub aliases: Vec<String>,
}

/// Snapshot returned by [`Engine::inspect_container`].
#[derive(Debug, Clone)]
pub struct ContainerInspect {
    pub id: String,
    pub name: Option<String>,
    pub status: ContainerStatus,
    pub exit_code: Option<i64>,
    /// `None` when the image defines no health check.
    pub health: Option<HealthStatus>,
    pub ports: HashMap<ContainerPort, Vec<PortBinding>>,
    pub networks: HashMap<String, NetworkAttachment>,
    pub labels: BTreeMap<String, String>,
    /// Set when the container shares the host network namespace.
    pub host_network: bool,
}

impl ContainerInspect {
    /// First host binding for `port`, if any.
    pub fn binding(&self, port: ContainerPort) -> Option<&PortBinding> {
        self.ports.get(&port).and_then(|b| b.first())
    }

    /// Lowest exposed port that has a host binding, optionally restricted to
    /// one protocol.
    pub fn lowest_bound_port(&self, protocol: Option<Protocol>) -> Option<ContainerPort> {
        self.ports
            .iter()
            .filter(|(p, b)| !b.is_empty() && protocol.is_none_or(|proto| p.protocol == proto))
            .map(|(p, _)| *p)
            .min_by_key(|p| p.port)
    }
}

/// Which output stream a log frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// A contiguous piece of log output from one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    pub stream: LogStream,
    pub data: Bytes,
}

/// Incremental log output returned by [`Engine::logs`].
///
/// `offset` is the absolute byte position of the first returned byte. It is
/// normally the offset the caller asked for; a smaller value means the log was
/// truncated or rotated and the engine restarted from the beginning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogChunk {
    pub offset: u64,
    pub frames: Vec<LogFrame>,
}

impl LogChunk {
    pub fn len(&self) -> u64 {
        self.frames.iter().map(|f| f.data.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.iter().all(|f| f.data.is_empty())
    }

    /// Offset to pass on the next call.
    pub fn next_offset(&self) -> u64 {
        self.offset + self.len()
    }

    /// All frames concatenated, regardless of stream.
    pub fn combined(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() as usize);
        for frame in &self.frames {
            out.extend_from_slice(&frame.data);
        }
        out
    }
}

/// Result of running a command inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// Everything the engine needs to create a network.
#[derive(Debug, Clone, Default)]
pub struct NetworkSpec {
    pub name: String,
    pub driver: Option<String>,
    pub internal: bool,
    pub labels: BTreeMap<String, String>,
}

/// The Engine Client Facade.
///
/// Implementations must be safe to share between tasks; read operations may
/// be called concurrently.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Host name or IP under which mapped ports are reachable.
    async fn host(&self) -> Result<String>;

    /// Pull `image` unless it is already present.
    async fn ensure_image(&self, image: &str) -> Result<()>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop with a grace period before the engine kills the process.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()>;

    /// Force-remove the container together with its anonymous volumes.
    async fn remove_container(&self, id: &str) -> Result<()>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect>;

    /// Log output from byte `since_offset` onwards.
    async fn logs(&self, id: &str, since_offset: u64) -> Result<LogChunk>;

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput>;

    /// Write `contents` to `path` inside the container with unix `mode`.
    async fn copy_to_container(&self, id: &str, path: &str, contents: Bytes, mode: u32)
    -> Result<()>;

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String>;

    async fn remove_network(&self, id: &str) -> Result<()>;

    /// IDs of all containers (running or not) whose labels match `filters`.
    async fn list_containers(&self, filters: &FilterSet) -> Result<Vec<String>>;

    /// IDs of all networks whose labels match `filters`.
    async fn list_networks(&self, filters: &FilterSet) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_container_port() {
        assert_eq!("8080".parse::<ContainerPort>().unwrap(), ContainerPort::tcp(8080));
        assert_eq!("53/udp".parse::<ContainerPort>().unwrap(), ContainerPort::udp(53));
        assert_eq!("5432/TCP".parse::<ContainerPort>().unwrap(), ContainerPort::tcp(5432));
        assert!("http".parse::<ContainerPort>().is_err());
        assert!("80/sctp".parse::<ContainerPort>().is_err());
    }

    #[test]
    fn test_port_display() {
        assert_eq!(ContainerPort::tcp(80).to_string(), "80/tcp");
    }

    #[test]
    fn test_lowest_bound_port_skips_unbound() {
        let mut ports = HashMap::new();
        ports.insert(ContainerPort::tcp(80), Vec::new());
        ports.insert(
            ContainerPort::tcp(443),
            vec![PortBinding {
                host_ip: "0.0.0.0".to_string(),
                host_port: 32768,
            }],
        );
        ports.insert(
            ContainerPort::udp(53),
            vec![PortBinding {
                host_ip: "0.0.0.0".to_string(),
                host_port: 32769,
            }],
        );
        let inspect = ContainerInspect {
            id: "c".to_string(),
            name: None,
            status: ContainerStatus::Running,
            exit_code: None,
            health: None,
            ports,
            networks: HashMap::new(),
            labels: BTreeMap::new(),
            host_network: false,
        };

        assert_eq!(inspect.lowest_bound_port(None), Some(ContainerPort::udp(53)));
        assert_eq!(
            inspect.lowest_bound_port(Some(Protocol::Tcp)),
            Some(ContainerPort::tcp(443))
        );
    }

    #[test]
    fn test_log_chunk_offsets() {
        let chunk = LogChunk {
            offset: 10,
            frames: vec![
                LogFrame {
                    stream: LogStream::Stdout,
                    data: Bytes::from_static(b"abc"),
                },
                LogFrame {
                    stream: LogStream::Stderr,
                    data: Bytes::from_static(b"de"),
                },
            ],
        };
        assert_eq!(chunk.len(), 5);
        assert_eq!(chunk.next_offset(), 15);
        assert_eq!(chunk.combined(), b"abcde".to_vec());
    }
}
