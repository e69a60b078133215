//! Handle to a created resource.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};

use crate::engine::{ContainerInspect, ContainerPort, ContainerStatus, Engine, ExecOutput};
use crate::error::EngineError;
use crate::lifecycle::Provider;
use crate::lifecycle::error::Result;
use crate::lifecycle::hooks::LifecycleHooks;
use crate::lifecycle::logs::{LogConsumer, LogFollower};
use crate::lifecycle::request::{ContainerFile, ResourceRequest};
use crate::wait::{WaitContext, WaitTarget};

const LOG_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A created container.
///
/// Metadata (host, ports, aliases) is cached and refreshed only by explicit
/// inspect calls. After [`terminate`](Self::terminate) the handle is inert.
pub struct ResourceHandle {
    id: String,
    provider: Provider,
    request: Arc<ResourceRequest>,
    hooks: LifecycleHooks,
    host: OnceCell<String>,
    cached: RwLock<Option<ContainerInspect>>,
    followers: Mutex<Vec<LogFollower>>,
    terminated: AtomicBool,
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.id)
            .field("image", &self.request.image)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl ResourceHandle {
    pub(crate) fn new(
        id: String,
        provider: Provider,
        request: ResourceRequest,
        hooks: LifecycleHooks,
    ) -> Self {
        Self {
            id,
            provider,
            request: Arc::new(request),
            hooks,
            host: OnceCell::new(),
            cached: RwLock::new(None),
            followers: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image(&self) -> &str {
        &self.request.image
    }

    /// The request as it was after pre-create hooks ran.
    pub fn request(&self) -> &ResourceRequest {
        &self.request
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub(crate) fn hooks(&self) -> &LifecycleHooks {
        &self.hooks
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Claim termination; `false` if it already happened or is underway.
    pub(crate) fn begin_terminate(&self) -> bool {
        !self.terminated.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn abort_terminate(&self) {
        self.terminated.store(false, Ordering::SeqCst);
    }

    /// Host under which mapped ports are reachable.
    pub async fn host(&self) -> std::result::Result<String, EngineError> {
        self.host
            .get_or_try_init(|| self.provider.engine().host())
            .await
            .cloned()
    }

    /// Inspect the container and update the cached metadata.
    pub async fn refresh(&self) -> std::result::Result<ContainerInspect, EngineError> {
        let inspect = self.provider.engine().inspect_container(&self.id).await?;
        *self.cached.write().unwrap_or_else(|e| e.into_inner()) = Some(inspect.clone());
        Ok(inspect)
    }

    /// Metadata from the last inspect, if any.
    pub fn cached(&self) -> Option<ContainerInspect> {
        self.cached
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn state(&self) -> std::result::Result<ContainerStatus, EngineError> {
        Ok(self.refresh().await?.status)
    }

    /// Host port bound to `port`. Always re-inspects, since bindings appear
    /// only once the container is started.
    pub async fn mapped_port(
        &self,
        port: impl Into<ContainerPort>,
    ) -> std::result::Result<u16, EngineError> {
        let port = port.into();
        let inspect = self.refresh().await?;
        if inspect.host_network {
            return Ok(port.port);
        }
        inspect
            .binding(port)
            .map(|b| b.host_port)
            .ok_or_else(|| EngineError::PortNotMapped {
                id: self.id.clone(),
                port: port.to_string(),
            })
    }

    /// `host:port` for `port`, prefixed with `scheme://` when given.
    pub async fn endpoint(
        &self,
        port: impl Into<ContainerPort>,
        scheme: Option<&str>,
    ) -> std::result::Result<String, EngineError> {
        let host = self.host().await?;
        let mapped = self.mapped_port(port).await?;
        Ok(match scheme {
            Some(scheme) => format!("{scheme}://{host}:{mapped}"),
            None => format!("{host}:{mapped}"),
        })
    }

    /// Aliases per attached network.
    pub async fn network_aliases(
        &self,
    ) -> std::result::Result<HashMap<String, Vec<String>>, EngineError> {
        Ok(self
            .refresh()
            .await?
            .networks
            .into_iter()
            .map(|(name, attachment)| (name, attachment.aliases))
            .collect())
    }

    pub async fn exec<S: AsRef<str>>(
        &self,
        cmd: &[S],
    ) -> std::result::Result<ExecOutput, EngineError> {
        let cmd: Vec<String> = cmd.iter().map(|s| s.as_ref().to_string()).collect();
        self.provider.engine().exec(&self.id, &cmd).await
    }

    /// Entire log output so far, both streams interleaved.
    pub async fn logs(&self) -> std::result::Result<String, EngineError> {
        let chunk = self.provider.engine().logs(&self.id, 0).await?;
        Ok(String::from_utf8_lossy(&chunk.combined()).to_string())
    }

    pub async fn copy_file(&self, file: &ContainerFile) -> std::result::Result<(), EngineError> {
        self.provider
            .engine()
            .copy_to_container(&self.id, &file.path, file.contents.clone(), file.mode)
            .await
    }

    /// Stream log output to `consumer` until the handle is terminated.
    pub async fn follow_logs(&self, consumer: Arc<dyn LogConsumer>) {
        let follower = LogFollower::spawn(
            self.provider.engine().clone(),
            self.id.clone(),
            consumer,
            LOG_POLL_INTERVAL,
        );
        self.followers.lock().await.push(follower);
    }

    /// Stop all log followers, draining pending output.
    pub async fn stop_log_followers(&self) {
        let followers: Vec<LogFollower> = self.followers.lock().await.drain(..).collect();
        for follower in followers {
            follower.stop().await;
        }
    }

    /// Run termination through the owning provider.
    pub async fn terminate(&self) -> Result<()> {
        self.provider.terminate(&WaitContext::default(), self).await
    }
}

#[async_trait]
impl WaitTarget for ResourceHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn engine(&self) -> &dyn Engine {
        self.provider.engine().as_ref()
    }

    async fn host(&self) -> std::result::Result<String, EngineError> {
        ResourceHandle::host(self).await
    }

    async fn inspect(&self) -> std::result::Result<ContainerInspect, EngineError> {
        self.refresh().await
    }
}
