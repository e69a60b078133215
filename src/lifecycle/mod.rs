//! Lifecycle Hook Pipeline.
//!
//! [`Provider`] wraps the engine's create / start / terminate calls with
//! ordered hooks. Provider defaults (session labels, reaper registration,
//! file copies, log following, readiness waiting) are themselves hooks and
//! run around the caller's: defaults first in `pre-*` phases, last in
//! `post-*` phases.
//!
//! ```text
//!   create:    pre-create ─► pull ─► engine create ─► post-create
//!   start:     pre-start ─► engine start ─► post-start (… readiness wait)
//!   terminate: pre-terminate ─► stop ─► remove ─► post-terminate
//! ```
//!
//! Any failure after the engine has assigned an id returns the handle inside
//! the error, so the caller can still inspect or terminate it.

pub mod cleanup;
mod defaults;
pub mod error;
mod handle;
pub mod hooks;
pub mod logs;
pub mod parallel;
pub mod request;

use std::collections::BTreeMap;
use std::sync::Arc;

pub use cleanup::{ResourceGuard, cleanup_resource};
pub use error::{LifecycleError, Phase, Result, TerminationError};
pub use handle::ResourceHandle;
pub use hooks::{LifecycleHooks, LifecycleHooksBuilder, pre_create_hook, resource_hook};
pub use logs::{CollectingConsumer, LogConsumer, LogFollower, TracingConsumer};
pub use parallel::{DEFAULT_WORKERS, ParallelError};
pub use request::{ContainerFile, Customize, RequestOption, ResourceRequest};

use crate::config::Config;
use crate::engine::{DockerEngine, Engine, NetworkSpec};
use crate::reaper::client::ReaperClient;
use crate::session::{LABEL_REAP, LABEL_SESSION_ID, Session};
use crate::wait::WaitContext;

/// A network to create for the session.
#[derive(Debug, Clone, Default)]
pub struct NetworkRequest {
    pub name: String,
    pub driver: Option<String>,
    pub internal: bool,
    pub labels: BTreeMap<String, String>,
    pub skip_reaper: bool,
}

impl NetworkRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A created network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHandle {
    pub id: String,
    pub name: String,
}

struct ProviderInner {
    engine: Arc<dyn Engine>,
    config: Config,
    session: Arc<Session>,
    reaper: Option<Arc<ReaperClient>>,
    defaults: LifecycleHooks,
}

/// Creates, starts and terminates resources. Cheap to clone.
#[derive(Clone)]
pub struct Provider {
    inner: Arc<ProviderInner>,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("session", &self.inner.session.id())
            .field("reaper", &self.inner.reaper.is_some())
            .finish_non_exhaustive()
    }
}

impl Provider {
    /// A provider for the process-wide session. Unless disabled in `config`,
    /// a reaper sidecar is started on first use.
    pub fn new(engine: Arc<dyn Engine>, config: Config) -> Self {
        Self::with_session(engine, config, Session::global())
    }

    pub fn with_session(engine: Arc<dyn Engine>, config: Config, session: Arc<Session>) -> Self {
        let reaper = (!config.reaper.disabled).then(|| {
            Arc::new(ReaperClient::new(
                engine.clone(),
                config.reaper.clone(),
                session.clone(),
            ))
        });
        Self::with_parts(engine, config, session, reaper)
    }

    /// Assemble a provider from explicit parts, e.g. a reaper client pointed
    /// at an already running sidecar.
    pub fn with_parts(
        engine: Arc<dyn Engine>,
        config: Config,
        session: Arc<Session>,
        reaper: Option<Arc<ReaperClient>>,
    ) -> Self {
        let defaults =
            defaults::default_hooks(session.clone(), reaper.clone(), config.reaper.required);
        Self {
            inner: Arc::new(ProviderInner {
                engine,
                config,
                session,
                reaper,
                defaults,
            }),
        }
    }

    /// Resolve configuration from the environment and connect to Docker.
    pub async fn from_env() -> Result<Self> {
        let config = Config::resolve()?;
        let engine = DockerEngine::connect(&config.engine)
            .await
            .map_err(|source| LifecycleError::Engine {
                operation: "connect",
                source,
                handle: None,
            })?;
        Ok(Self::new(Arc::new(engine), config))
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.inner.engine
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    pub fn reaper(&self) -> Option<&Arc<ReaperClient>> {
        self.inner.reaper.as_ref()
    }

    /// Create a container without starting it.
    pub async fn create(&self, ctx: &WaitContext, request: ResourceRequest) -> Result<ResourceHandle> {
        let mut request = request;
        let hooks = LifecycleHooks::around(&self.inner.defaults, &request.hooks);
        hooks.run_pre_create(ctx, &mut request).await?;

        let engine = &self.inner.engine;
        let image = self.inner.config.engine.image_name(&request.image);
        engine
            .ensure_image(&image)
            .await
            .map_err(|source| LifecycleError::Engine {
                operation: "pull",
                source,
                handle: None,
            })?;
        let id = engine
            .create_container(&request.to_spec(image.clone()))
            .await
            .map_err(|source| LifecycleError::Engine {
                operation: "create",
                source,
                handle: None,
            })?;
        self.inner.session.track_container(&id);
        tracing::info!(container_id = %id, image = %image, "Created container");

        let handle = ResourceHandle::new(id, self.clone(), request, hooks);
        if let Err(e) = handle.hooks().run(Phase::PostCreate, ctx, &handle).await {
            return Err(e.attach(handle));
        }
        Ok(handle)
    }

    /// Start a created container. Returns once post-start hooks, including
    /// the readiness wait, have completed.
    pub async fn start(&self, ctx: &WaitContext, handle: &ResourceHandle) -> Result<()> {
        handle.hooks().run(Phase::PreStart, ctx, handle).await?;
        self.inner
            .engine
            .start_container(handle.id())
            .await
            .map_err(|source| LifecycleError::Engine {
                operation: "start",
                source,
                handle: None,
            })?;
        tracing::debug!(container_id = %handle.id(), "Started container");
        handle.hooks().run(Phase::PostStart, ctx, handle).await
    }

    /// Create and start. On failure after creation the error carries the
    /// handle.
    pub async fn run(&self, ctx: &WaitContext, request: ResourceRequest) -> Result<ResourceHandle> {
        let handle = self.create(ctx, request).await?;
        match self.start(ctx, &handle).await {
            Ok(()) => Ok(handle),
            Err(e) => Err(e.attach(handle)),
        }
    }

    /// Stop and remove. A resource that is already gone counts as removed;
    /// terminating twice is a no-op.
    pub async fn terminate(&self, ctx: &WaitContext, handle: &ResourceHandle) -> Result<()> {
        if !handle.begin_terminate() {
            return Ok(());
        }
        if let Err(e) = handle.hooks().run(Phase::PreTerminate, ctx, handle).await {
            handle.abort_terminate();
            return Err(e);
        }

        let engine = &self.inner.engine;
        let id = handle.id();
        if let Err(e) = engine
            .stop_container(id, self.inner.config.lifecycle.stop_grace)
            .await
            && !e.is_not_found()
        {
            tracing::debug!(container_id = %id, error = %e, "Stop failed; removing anyway");
        }
        match engine.remove_container(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(source) => {
                let err = TerminationError {
                    resource_id: id.to_string(),
                    source,
                };
                tracing::warn!(container_id = %id, "{}", err);
                handle.abort_terminate();
                return Err(err.into());
            }
        }
        self.inner.session.forget(id);
        tracing::info!(container_id = %id, "Terminated container");

        handle.hooks().run(Phase::PostTerminate, ctx, handle).await
    }

    /// Create a session network.
    pub async fn create_network(&self, request: NetworkRequest) -> Result<NetworkHandle> {
        let mut labels = request.labels;
        labels.insert(
            LABEL_SESSION_ID.to_string(),
            self.inner.session.id().to_string(),
        );
        if !request.skip_reaper {
            labels.insert(LABEL_REAP.to_string(), "true".to_string());
            if let Some(reaper) = &self.inner.reaper
                && let Err(e) = reaper.ensure_registered().await
            {
                if self.inner.config.reaper.required {
                    return Err(e.into());
                }
                reaper.warn_degraded(&e);
            }
        }

        let spec = NetworkSpec {
            name: request.name.clone(),
            driver: request.driver,
            internal: request.internal,
            labels,
        };
        let id = self
            .inner
            .engine
            .create_network(&spec)
            .await
            .map_err(|source| LifecycleError::Engine {
                operation: "create_network",
                source,
                handle: None,
            })?;
        self.inner.session.track_network(&id);
        tracing::info!(network_id = %id, name = %request.name, "Created network");
        Ok(NetworkHandle {
            id,
            name: request.name,
        })
    }

    /// Remove a network. Containers attached to it must be terminated first.
    pub async fn remove_network(&self, network: &NetworkHandle) -> Result<()> {
        match self.inner.engine.remove_network(&network.id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(source) => {
                return Err(TerminationError {
                    resource_id: network.id.clone(),
                    source,
                }
                .into());
            }
        }
        self.inner.session.forget(&network.id);
        tracing::info!(network_id = %network.id, "Removed network");
        Ok(())
    }

    /// Remove everything the session still tracks, containers before
    /// networks.
    pub async fn teardown(&self) -> Vec<TerminationError> {
        self.inner
            .session
            .teardown(
                self.inner.engine.as_ref(),
                self.inner.config.lifecycle.stop_grace,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::engine::ContainerPort;
    use crate::error::EngineError;
    use crate::testing::FakeEngine;
    use crate::wait::WaitSpec;
    use pretty_assertions::assert_eq;

    fn provider(engine: &Arc<FakeEngine>) -> Provider {
        let mut config = Config::default();
        config.reaper.disabled = true;
        Provider::with_session(engine.clone(), config, Arc::new(Session::with_id("s1")))
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> LifecycleHooks {
        let pre = log.clone();
        let post = log.clone();
        LifecycleHooks::builder()
            .pre_start(resource_hook(move |_, _| {
                let log = pre.clone();
                Box::pin(async move {
                    log.lock().unwrap().push(format!("{name}:pre-start"));
                    Ok(())
                })
            }))
            .post_start(resource_hook(move |_, _| {
                let log = post.clone();
                Box::pin(async move {
                    log.lock().unwrap().push(format!("{name}:post-start"));
                    Ok(())
                })
            }))
            .build()
    }

    #[tokio::test]
    async fn test_create_stamps_session_labels() {
        let engine = Arc::new(FakeEngine::new());
        let provider = provider(&engine);

        let handle = provider
            .create(&WaitContext::default(), ResourceRequest::new("redis:7"))
            .await
            .unwrap();

        let labels = engine.labels(handle.id()).unwrap();
        assert_eq!(labels[LABEL_SESSION_ID], "s1");
        assert_eq!(labels[LABEL_REAP], "true");
        assert_eq!(provider.session().tracked().len(), 1);
    }

    #[tokio::test]
    async fn test_skip_reaper_omits_reap_label() {
        let engine = Arc::new(FakeEngine::new());
        let provider = provider(&engine);
        let request = ResourceRequest::new("redis")
            .customize([RequestOption::SkipReaper])
            .unwrap();

        let handle = provider.create(&WaitContext::default(), request).await.unwrap();
        let labels = engine.labels(handle.id()).unwrap();
        assert!(!labels.contains_key(LABEL_REAP));
        assert_eq!(labels[LABEL_SESSION_ID], "s1");
    }

    #[tokio::test]
    async fn test_user_hooks_run_in_registration_order() {
        let engine = Arc::new(FakeEngine::new());
        let provider = provider(&engine);
        let log = Arc::new(Mutex::new(Vec::new()));

        let request = ResourceRequest::new("app")
            .with_hooks(recorder(&log, "first"))
            .with_hooks(recorder(&log, "second"));
        provider.run(&WaitContext::default(), request).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "first:pre-start",
                "second:pre-start",
                "first:post-start",
                "second:post-start",
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_hook_stops_phase_and_returns_handle() {
        let engine = Arc::new(FakeEngine::new());
        let provider = provider(&engine);
        let ran = Arc::new(Mutex::new(false));
        let ran_clone = ran.clone();

        let hooks = LifecycleHooks::builder()
            .post_create(resource_hook(|_, _| {
                Box::pin(async { Err::<(), _>(anyhow::anyhow!("boom")) })
            }))
            .post_create(resource_hook(move |_, _| {
                let ran = ran_clone.clone();
                Box::pin(async move {
                    *ran.lock().unwrap() = true;
                    Ok(())
                })
            }))
            .build();

        let err = provider
            .create(&WaitContext::default(), ResourceRequest::new("app").with_hooks(hooks))
            .await
            .unwrap_err();
        match &err {
            LifecycleError::Hook { phase, index, .. } => {
                assert_eq!(*phase, Phase::PostCreate);
                assert_eq!(*index, 0);
            }
            other => panic!("expected hook error, got {other}"),
        }
        assert!(!*ran.lock().unwrap());

        let handle = err.into_handle().expect("handle is returned");
        assert!(engine.container_ids().contains(&handle.id().to_string()));
        handle.terminate().await.unwrap();
        assert!(engine.container_ids().is_empty());
    }

    #[tokio::test]
    async fn test_pre_create_hook_can_rewrite_request() {
        let engine = Arc::new(FakeEngine::new());
        let provider = provider(&engine);
        let hooks = LifecycleHooks::builder()
            .pre_create(pre_create_hook(|_, req| {
                Box::pin(async move {
                    req.image = "redis:7-alpine".to_string();
                    Ok(())
                })
            }))
            .build();

        let handle = provider
            .create(&WaitContext::default(), ResourceRequest::new("redis").with_hooks(hooks))
            .await
            .unwrap();
        assert_eq!(engine.image(handle.id()).as_deref(), Some("redis:7-alpine"));
    }

    #[tokio::test]
    async fn test_files_are_copied_before_start() {
        let engine = Arc::new(FakeEngine::new());
        let provider = provider(&engine);
        let request = ResourceRequest::new("app")
            .customize([RequestOption::File(
                ContainerFile::new("/etc/app.conf", "x=1").with_mode(0o600),
            )])
            .unwrap();

        let handle = provider.run(&WaitContext::default(), request).await.unwrap();
        let (contents, mode) = engine.file(handle.id(), "/etc/app.conf").unwrap();
        assert_eq!(&contents[..], b"x=1");
        assert_eq!(mode, 0o600);

        let calls = engine.calls();
        let copy = calls.iter().position(|c| c.starts_with("copy:")).unwrap();
        let start = calls.iter().position(|c| c.starts_with("start:")).unwrap();
        assert!(copy < start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_failure_returns_handle_unterminated() {
        let engine = Arc::new(FakeEngine::new());
        let provider = provider(&engine);
        let request = ResourceRequest::new("db").with_wait(
            crate::wait::LogStrategy::new("ready").with_startup_timeout(Duration::from_secs(2)),
        );

        let err = provider
            .run(&WaitContext::default(), request)
            .await
            .unwrap_err();
        assert!(err.wait_error().is_some_and(|w| w.is_timeout()));
        let handle = err.handle().expect("handle is returned");
        assert!(!handle.is_terminated());
        assert_eq!(engine.container_ids(), vec![handle.id().to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_waits_for_readiness() {
        let engine = Arc::new(FakeEngine::new());
        let provider = provider(&engine);
        let request = ResourceRequest::new("db")
            .with_exposed_port(5432u16)
            .with_wait(WaitSpec::for_exec(["pg_isready"]));

        let handle = provider.run(&WaitContext::default(), request).await.unwrap();
        assert!(
            engine
                .calls()
                .contains(&format!("exec:{}:pg_isready", handle.id()))
        );
        assert!(handle.mapped_port(ContainerPort::tcp(5432)).await.unwrap() >= 49152);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_and_tolerates_missing() {
        let engine = Arc::new(FakeEngine::new());
        let provider = provider(&engine);
        let handle = provider
            .run(&WaitContext::default(), ResourceRequest::new("app"))
            .await
            .unwrap();

        engine.remove_container(handle.id()).await.unwrap();
        handle.terminate().await.unwrap();
        assert!(handle.is_terminated());
        handle.terminate().await.unwrap();
        assert!(provider.session().tracked().is_empty());
    }

    #[tokio::test]
    async fn test_termination_failure_is_reported() {
        let engine = Arc::new(FakeEngine::new());
        let provider = provider(&engine);
        let handle = provider
            .run(&WaitContext::default(), ResourceRequest::new("app"))
            .await
            .unwrap();

        engine.fail("remove_container", "daemon busy");
        let err = handle.terminate().await.unwrap_err();
        match err {
            LifecycleError::Termination(t) => {
                assert_eq!(t.resource_id, handle.id());
                assert!(matches!(t.source, EngineError::Api { .. }));
            }
            other => panic!("expected termination error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_network_removed_after_its_containers() {
        let engine = Arc::new(FakeEngine::new());
        let provider = provider(&engine);
        let network = provider
            .create_network(NetworkRequest::new("backend"))
            .await
            .unwrap();

        let app = provider
            .run(
                &WaitContext::default(),
                ResourceRequest::new("app").with_network("backend", &["app"]),
            )
            .await
            .unwrap();

        assert!(provider.teardown().await.is_empty());
        let removals: Vec<String> = engine
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("remove"))
            .collect();
        assert_eq!(
            removals,
            vec![
                format!("remove:{}", app.id()),
                format!("remove_network:{}", network.id),
            ]
        );
        assert!(engine.network_ids().is_empty());
        assert!(engine.container_ids().is_empty());
    }
}
