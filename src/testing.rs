//! Test support: an in-memory [`Engine`].
//!
//! Provides:
//! - [`FakeEngine`]: a scripted engine with containers, networks, timed log
//!   output, port mappings, exec results, health states and a call journal
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use throwaway::testing::FakeEngine;
//!
//! # async fn demo() {
//! let engine = Arc::new(FakeEngine::new());
//! let id = engine.add_running("db");
//! engine.emit_log_after(&id, Duration::from_secs(2), "ready to accept connections\n");
//! # }
//! ```
//!
//! Log timestamps use tokio's clock, so tests running with
//! `#[tokio::test(start_paused = true)]` see output appear as virtual time
//! advances.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use crate::engine::{
    ContainerInspect, ContainerPort, ContainerSpec, ContainerStatus, Engine, ExecOutput,
    HealthStatus, LogChunk, LogFrame, LogStream, NetworkAttachment, NetworkSpec, PortBinding,
    Result,
};
use crate::error::EngineError;
use crate::reaper::protocol::FilterSet;

/// First host port handed out for exposed ports.
const FIRST_HOST_PORT: u16 = 49152;

struct FakeContainer {
    id: String,
    name: Option<String>,
    image: String,
    status: ContainerStatus,
    exit_code: Option<i64>,
    health: Option<HealthStatus>,
    host_network: bool,
    ports: HashMap<ContainerPort, Vec<PortBinding>>,
    networks: BTreeMap<String, Vec<String>>,
    labels: BTreeMap<String, String>,
    logs: Vec<(Instant, LogFrame)>,
    exec_results: HashMap<String, i64>,
    default_exec: i64,
    files: HashMap<String, (Bytes, u32)>,
}

impl FakeContainer {
    fn new(id: String, image: String) -> Self {
        Self {
            id,
            name: None,
            image,
            status: ContainerStatus::Created,
            exit_code: None,
            health: None,
            host_network: false,
            ports: HashMap::new(),
            networks: BTreeMap::new(),
            labels: BTreeMap::new(),
            logs: Vec::new(),
            exec_results: HashMap::new(),
            default_exec: 0,
            files: HashMap::new(),
        }
    }

    fn visible_logs(&self) -> Vec<LogFrame> {
        let now = Instant::now();
        self.logs
            .iter()
            .filter(|(at, _)| *at <= now)
            .map(|(_, frame)| frame.clone())
            .collect()
    }
}

struct FakeNetwork {
    id: String,
    name: String,
    labels: BTreeMap<String, String>,
}

#[derive(Default)]
struct State {
    containers: BTreeMap<String, FakeContainer>,
    networks: BTreeMap<String, FakeNetwork>,
    calls: Vec<String>,
    failures: HashMap<&'static str, String>,
}

impl State {
    fn check(&self, operation: &'static str) -> Result<()> {
        match self.failures.get(operation) {
            Some(reason) => Err(EngineError::api(operation, reason)),
            None => Ok(()),
        }
    }

    fn container(&mut self, id: &str) -> Result<&mut FakeContainer> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound { id: id.to_string() })
    }

    fn network_id(&self, id_or_name: &str) -> Option<String> {
        self.networks
            .values()
            .find(|n| n.id == id_or_name || n.name == id_or_name)
            .map(|n| n.id.clone())
    }
}

/// A scripted in-memory engine.
///
/// All state sits behind one mutex; calls are journalled in order and can be
/// read back with [`calls()`](Self::calls).
pub struct FakeEngine {
    host: String,
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            state: Mutex::new(State::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_container(&self, id: &str, f: impl FnOnce(&mut FakeContainer)) {
        if let Some(c) = self.lock().containers.get_mut(id) {
            f(c);
        }
    }

    /// Insert a running container whose id is `id`.
    pub fn add_running(&self, id: &str) -> String {
        self.add_labeled(id, BTreeMap::new())
    }

    /// Insert a running container with labels, as if created by another
    /// process.
    pub fn add_labeled(&self, id: &str, labels: BTreeMap<String, String>) -> String {
        let mut container = FakeContainer::new(id.to_string(), "fake:latest".to_string());
        container.status = ContainerStatus::Running;
        container.labels = labels;
        self.lock().containers.insert(id.to_string(), container);
        id.to_string()
    }

    /// Insert a network with labels. Returns its id.
    pub fn add_network(&self, name: &str, labels: BTreeMap<String, String>) -> String {
        let id = format!("net-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.lock().networks.insert(
            id.clone(),
            FakeNetwork {
                id: id.clone(),
                name: name.to_string(),
                labels,
            },
        );
        id
    }

    /// Mark the container exited with `code`.
    pub fn exit(&self, id: &str, code: i64) {
        self.with_container(id, |c| {
            c.status = ContainerStatus::Exited;
            c.exit_code = Some(code);
        });
    }

    pub fn set_status(&self, id: &str, status: ContainerStatus) {
        self.with_container(id, |c| c.status = status);
    }

    pub fn set_health(&self, id: &str, health: Option<HealthStatus>) {
        self.with_container(id, |c| c.health = health);
    }

    /// Attach the container to the host network; it then has no bindings.
    pub fn use_host_network(&self, id: &str) {
        self.with_container(id, |c| {
            c.host_network = true;
            c.ports.clear();
        });
    }

    /// Bind container `port` to `host_port` on the fake host.
    pub fn map_port(&self, id: &str, port: ContainerPort, host_port: u16) {
        self.with_container(id, |c| {
            c.ports.insert(
                port,
                vec![PortBinding {
                    host_ip: "0.0.0.0".to_string(),
                    host_port,
                }],
            );
        });
    }

    /// Append stdout output visible immediately.
    pub fn emit_log(&self, id: &str, text: &str) {
        self.emit_log_after(id, Duration::ZERO, text);
    }

    /// Append stderr output visible immediately.
    pub fn emit_stderr(&self, id: &str, text: &str) {
        let frame = LogFrame {
            stream: LogStream::Stderr,
            data: Bytes::copy_from_slice(text.as_bytes()),
        };
        self.with_container(id, |c| c.logs.push((Instant::now(), frame)));
    }

    /// Append stdout output that becomes visible after `delay`.
    pub fn emit_log_after(&self, id: &str, delay: Duration, text: &str) {
        let frame = LogFrame {
            stream: LogStream::Stdout,
            data: Bytes::copy_from_slice(text.as_bytes()),
        };
        let at = Instant::now() + delay;
        self.with_container(id, |c| c.logs.push((at, frame)));
    }

    /// Drop all log output, as a log rotation would.
    pub fn truncate_logs(&self, id: &str) {
        self.with_container(id, |c| c.logs.clear());
    }

    /// Exit code returned when `cmd` is exec'd in the container.
    pub fn set_exec_result(&self, id: &str, cmd: &[&str], exit_code: i64) {
        let key = cmd.join(" ");
        self.with_container(id, |c| {
            c.exec_results.insert(key, exit_code);
        });
    }

    /// Exit code for commands without a specific result.
    pub fn set_default_exec_result(&self, id: &str, exit_code: i64) {
        self.with_container(id, |c| c.default_exec = exit_code);
    }

    /// Make every call to `operation` fail until [`clear_failure`](Self::clear_failure).
    pub fn fail(&self, operation: &'static str, reason: &str) {
        self.lock().failures.insert(operation, reason.to_string());
    }

    pub fn clear_failure(&self, operation: &'static str) {
        self.lock().failures.remove(operation);
    }

    /// Journal of mutating calls, e.g. `create:redis:7`, `start:fake-1`,
    /// `remove_network:net-2`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }

    pub fn network_ids(&self) -> Vec<String> {
        self.lock().networks.keys().cloned().collect()
    }

    pub fn labels(&self, id: &str) -> Option<BTreeMap<String, String>> {
        self.lock().containers.get(id).map(|c| c.labels.clone())
    }

    pub fn image(&self, id: &str) -> Option<String> {
        self.lock().containers.get(id).map(|c| c.image.clone())
    }

    /// Contents and mode of a file copied into the container.
    pub fn file(&self, id: &str, path: &str) -> Option<(Bytes, u32)> {
        self.lock()
            .containers
            .get(id)
            .and_then(|c| c.files.get(path).cloned())
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn host(&self) -> Result<String> {
        Ok(self.host.clone())
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        let mut state = self.lock();
        state.check("ensure_image")?;
        state.calls.push(format!("pull:{image}"));
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        state.check("create_container")?;

        for network in spec.networks.keys() {
            if state.network_id(network).is_none() {
                return Err(EngineError::NotFound {
                    id: network.clone(),
                });
            }
        }

        let id = format!("fake-{n}");
        let mut container = FakeContainer::new(id.clone(), spec.image.clone());
        container.name = spec.name.clone();
        container.labels = spec.labels.clone();
        container.networks = spec.networks.clone();
        for (i, port) in spec.exposed_ports.iter().enumerate() {
            container.ports.insert(
                *port,
                vec![PortBinding {
                    host_ip: "0.0.0.0".to_string(),
                    host_port: FIRST_HOST_PORT.saturating_add((n as u16).wrapping_mul(16)).saturating_add(i as u16),
                }],
            );
        }

        state.calls.push(format!("create:{}", spec.image));
        state.containers.insert(id.clone(), container);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.check("start_container")?;
        state.container(id)?.status = ContainerStatus::Running;
        state.calls.push(format!("start:{id}"));
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<()> {
        let mut state = self.lock();
        state.check("stop_container")?;
        let container = state.container(id)?;
        if !container.status.is_terminal() {
            container.status = ContainerStatus::Exited;
            container.exit_code = Some(0);
        }
        state.calls.push(format!("stop:{id}"));
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.check("remove_container")?;
        state
            .containers
            .remove(id)
            .ok_or_else(|| EngineError::NotFound { id: id.to_string() })?;
        state.calls.push(format!("remove:{id}"));
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect> {
        let mut state = self.lock();
        state.check("inspect_container")?;
        let c = state.container(id)?;
        Ok(ContainerInspect {
            id: c.id.clone(),
            name: c.name.clone(),
            status: c.status,
            exit_code: c.exit_code,
            health: c.health,
            ports: c.ports.clone(),
            networks: c
                .networks
                .iter()
                .map(|(name, aliases)| {
                    (
                        name.clone(),
                        NetworkAttachment {
                            ip_address: None,
                            aliases: aliases.clone(),
                        },
                    )
                })
                .collect(),
            labels: c.labels.clone(),
            host_network: c.host_network,
        })
    }

    async fn logs(&self, id: &str, since_offset: u64) -> Result<LogChunk> {
        let mut state = self.lock();
        state.check("logs")?;
        let frames = state.container(id)?.visible_logs();
        let total: u64 = frames.iter().map(|f| f.data.len() as u64).sum();
        if total < since_offset {
            return Ok(LogChunk { offset: 0, frames });
        }

        let mut skip = since_offset;
        let mut out = Vec::new();
        for frame in frames {
            let len = frame.data.len() as u64;
            if skip >= len {
                skip -= len;
                continue;
            }
            out.push(LogFrame {
                stream: frame.stream,
                data: frame.data.slice(skip as usize..),
            });
            skip = 0;
        }
        Ok(LogChunk {
            offset: since_offset,
            frames: out,
        })
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput> {
        let mut state = self.lock();
        state.check("exec")?;
        let c = state.container(id)?;
        if c.status != ContainerStatus::Running {
            return Err(EngineError::Conflict {
                id: id.to_string(),
                reason: format!("container is {}", c.status.as_str()),
            });
        }
        let key = cmd.join(" ");
        let exit_code = c.exec_results.get(&key).copied().unwrap_or(c.default_exec);
        state.calls.push(format!("exec:{id}:{key}"));
        Ok(ExecOutput {
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn copy_to_container(
        &self,
        id: &str,
        path: &str,
        contents: Bytes,
        mode: u32,
    ) -> Result<()> {
        let mut state = self.lock();
        state.check("copy_to_container")?;
        state
            .container(id)?
            .files
            .insert(path.to_string(), (contents, mode));
        state.calls.push(format!("copy:{id}:{path}"));
        Ok(())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        state.check("create_network")?;
        if state.network_id(&spec.name).is_some() {
            return Err(EngineError::Conflict {
                id: spec.name.clone(),
                reason: "network already exists".to_string(),
            });
        }
        let id = format!("net-{n}");
        state.networks.insert(
            id.clone(),
            FakeNetwork {
                id: id.clone(),
                name: spec.name.clone(),
                labels: spec.labels.clone(),
            },
        );
        state.calls.push(format!("create_network:{}", spec.name));
        Ok(id)
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.check("remove_network")?;
        let network_id = state
            .network_id(id)
            .ok_or_else(|| EngineError::NotFound { id: id.to_string() })?;
        let name = state
            .networks
            .get(&network_id)
            .map(|n| n.name.clone())
            .unwrap_or_default();

        let in_use = state
            .containers
            .values()
            .any(|c| c.networks.contains_key(&name) || c.networks.contains_key(&network_id));
        if in_use {
            return Err(EngineError::Conflict {
                id: network_id,
                reason: "network has active endpoints".to_string(),
            });
        }

        state.networks.remove(&network_id);
        state.calls.push(format!("remove_network:{network_id}"));
        Ok(())
    }

    async fn list_containers(&self, filters: &FilterSet) -> Result<Vec<String>> {
        let state = self.lock();
        state.check("list_containers")?;
        Ok(state
            .containers
            .values()
            .filter(|c| filters.matches(&c.id, c.name.as_deref(), &c.labels))
            .map(|c| c.id.clone())
            .collect())
    }

    async fn list_networks(&self, filters: &FilterSet) -> Result<Vec<String>> {
        let state = self.lock();
        state.check("list_networks")?;
        Ok(state
            .networks
            .values()
            .filter(|n| filters.matches(&n.id, Some(&n.name), &n.labels))
            .map(|n| n.id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reaper::protocol::Filter;

    #[tokio::test(start_paused = true)]
    async fn test_delayed_logs_appear_with_time() {
        let engine = FakeEngine::new();
        let id = engine.add_running("c1");
        engine.emit_log(&id, "one\n");
        engine.emit_log_after(&id, Duration::from_secs(2), "two\n");

        assert_eq!(engine.logs(&id, 0).await.unwrap().combined(), b"one\n".to_vec());
        tokio::time::advance(Duration::from_secs(2)).await;
        let chunk = engine.logs(&id, 4).await.unwrap();
        assert_eq!(chunk.offset, 4);
        assert_eq!(chunk.combined(), b"two\n".to_vec());
    }

    #[tokio::test]
    async fn test_network_in_use_cannot_be_removed() {
        let engine = FakeEngine::new();
        let net = engine
            .create_network(&NetworkSpec {
                name: "backend".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let spec = ContainerSpec {
            image: "app".to_string(),
            networks: BTreeMap::from([("backend".to_string(), vec!["app".to_string()])]),
            ..Default::default()
        };
        let id = engine.create_container(&spec).await.unwrap();

        let err = engine.remove_network(&net).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));

        engine.remove_container(&id).await.unwrap();
        engine.remove_network(&net).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_by_label() {
        let engine = FakeEngine::new();
        engine.add_labeled(
            "a",
            BTreeMap::from([("session".to_string(), "s1".to_string())]),
        );
        engine.add_labeled(
            "b",
            BTreeMap::from([("session".to_string(), "s2".to_string())]),
        );
        let filters = FilterSet::new().with(Filter::label("session", "s1"));
        assert_eq!(engine.list_containers(&filters).await.unwrap(), vec!["a"]);
    }
}
