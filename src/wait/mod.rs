//! Wait Strategy Engine.
//!
//! A [`WaitSpec`] is a tree: leaves are single readiness probes, [`WaitSpec::All`]
//! runs several concurrently. [`wait_until_ready`] drives the tree against a
//! [`WaitTarget`] until every leaf succeeds, one fails fatally, a deadline
//! passes, or the caller cancels.
//!
//! ```text
//!   wait_until_ready(ctx, target, spec)
//!          │
//!          ├─ leaf ──► loop { running? ─► poll ─► ready | transient | fatal ; sleep }
//!          │
//!          └─ all ───► FuturesUnordered[ child, child, … ]  (fatal ⇒ cancel siblings)
//! ```
//!
//! Every evaluation builds fresh per-leaf poll state, so a spec can be reused
//! for any number of checks.

mod all;
mod error;
mod exec;
mod exit;
mod health;
mod http;
mod log;
mod port;
mod predicate;
#[cfg(feature = "postgres")]
mod sql;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use all::AllStrategy;
pub use error::{ProbeError, Result, WaitError};
pub use exec::ExecStrategy;
pub use exit::ExitStrategy;
pub use health::HealthStrategy;
pub use http::HttpStrategy;
pub use log::LogStrategy;
pub use port::PortStrategy;
pub use predicate::PredicateStrategy;
#[cfg(feature = "postgres")]
pub use sql::{SqlStrategy, classify_state};

use crate::config::WaitDefaults;
use crate::engine::{ContainerInspect, ContainerPort, Engine};
use crate::error::EngineError;

/// The resource a strategy probes.
#[async_trait]
pub trait WaitTarget: Send + Sync {
    fn id(&self) -> &str;

    fn engine(&self) -> &dyn Engine;

    async fn host(&self) -> std::result::Result<String, EngineError> {
        self.engine().host().await
    }

    async fn inspect(&self) -> std::result::Result<ContainerInspect, EngineError> {
        self.engine().inspect_container(self.id()).await
    }

    /// Host port bound to `port`. On the host network the port is the port.
    async fn mapped_port(&self, port: ContainerPort) -> std::result::Result<u16, EngineError> {
        let inspect = self.inspect().await?;
        if inspect.host_network {
            return Ok(port.port);
        }
        inspect
            .binding(port)
            .map(|b| b.host_port)
            .ok_or_else(|| EngineError::PortNotMapped {
                id: self.id().to_string(),
                port: port.to_string(),
            })
    }
}

/// A bare `(engine, id)` pair.
#[derive(Clone)]
pub struct Target {
    engine: Arc<dyn Engine>,
    id: String,
}

impl Target {
    pub fn new(engine: Arc<dyn Engine>, id: impl Into<String>) -> Self {
        Self {
            engine,
            id: id.into(),
        }
    }
}

impl WaitTarget for Target {
    fn id(&self) -> &str {
        &self.id
    }

    fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }
}

/// Cancellation and outer deadline for a readiness check.
#[derive(Debug, Clone, Default)]
pub struct WaitContext {
    pub cancel: CancellationToken,
    /// Caller deadline; each leaf stops at the earlier of this and its own
    /// timeout.
    pub deadline: Option<Instant>,
}

impl WaitContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// A context whose token is a child of this one: cancelling it does not
    /// cancel the parent.
    pub(crate) fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }
}

/// Per-evaluation probe state.
#[async_trait]
pub trait Poller: Send {
    /// One probe. `Ok(false)` and transient errors mean "poll again".
    async fn poll(&mut self, target: &dyn WaitTarget) -> std::result::Result<bool, ProbeError>;
}

/// A single readiness predicate with its polling policy.
pub trait Strategy: Send + Sync {
    /// Human-readable name used in errors and logs.
    fn name(&self) -> String;

    fn timeout(&self) -> Option<Duration>;

    fn poll_interval(&self) -> Option<Duration>;

    /// Whether the resource must be running for a probe to make sense.
    fn requires_running(&self) -> bool {
        true
    }

    /// Fresh poll state for one evaluation. Errors here are configuration
    /// errors and abort the wait.
    fn poller(&self) -> std::result::Result<Box<dyn Poller + '_>, ProbeError>;
}

/// Leaf timeout / interval overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timing {
    pub timeout: Option<Duration>,
    pub poll_interval: Option<Duration>,
}

macro_rules! timing_builders {
    ($ty:ty) => {
        impl $ty {
            /// Give up after `timeout` (bounded by any caller deadline).
            pub fn with_startup_timeout(mut self, timeout: std::time::Duration) -> Self {
                self.timing.timeout = Some(timeout);
                self
            }

            pub fn with_poll_interval(mut self, interval: std::time::Duration) -> Self {
                self.timing.poll_interval = Some(interval);
                self
            }
        }
    };
}
pub(crate) use timing_builders;

/// A tree of readiness strategies.
#[derive(Clone)]
pub enum WaitSpec {
    Log(LogStrategy),
    Port(PortStrategy),
    Http(HttpStrategy),
    #[cfg(feature = "postgres")]
    Sql(SqlStrategy),
    Exec(ExecStrategy),
    Health(HealthStrategy),
    Exit(ExitStrategy),
    Predicate(PredicateStrategy),
    All(AllStrategy),
}

impl WaitSpec {
    /// Log output contains `pattern` (once, by default).
    pub fn for_log(pattern: impl Into<String>) -> Self {
        WaitSpec::Log(LogStrategy::new(pattern))
    }

    /// A TCP dial to the host binding of `port` succeeds.
    pub fn for_listening_port(port: impl Into<ContainerPort>) -> Self {
        WaitSpec::Port(PortStrategy::new(port))
    }

    /// `GET path` on the lowest exposed port returns 200.
    pub fn for_http(path: impl Into<String>) -> Self {
        WaitSpec::Http(HttpStrategy::new(path))
    }

    /// The command exits with status 0 inside the resource.
    pub fn for_exec<S: Into<String>>(cmd: impl IntoIterator<Item = S>) -> Self {
        WaitSpec::Exec(ExecStrategy::new(cmd))
    }

    /// The engine health check reports healthy.
    pub fn for_healthcheck() -> Self {
        WaitSpec::Health(HealthStrategy::new())
    }

    /// The main process has exited.
    pub fn for_exit() -> Self {
        WaitSpec::Exit(ExitStrategy::new())
    }

    /// Every child succeeds, evaluated concurrently.
    pub fn all(children: impl IntoIterator<Item = WaitSpec>) -> Self {
        WaitSpec::All(AllStrategy::new(children))
    }

    pub fn name(&self) -> String {
        match self {
            WaitSpec::All(all) => all.name(),
            leaf => leaf.as_leaf().map(|l| l.name()).unwrap_or_default(),
        }
    }

    fn as_leaf(&self) -> Option<&dyn Strategy> {
        match self {
            WaitSpec::Log(s) => Some(s),
            WaitSpec::Port(s) => Some(s),
            WaitSpec::Http(s) => Some(s),
            #[cfg(feature = "postgres")]
            WaitSpec::Sql(s) => Some(s),
            WaitSpec::Exec(s) => Some(s),
            WaitSpec::Health(s) => Some(s),
            WaitSpec::Exit(s) => Some(s),
            WaitSpec::Predicate(s) => Some(s),
            WaitSpec::All(_) => None,
        }
    }
}

impl fmt::Debug for WaitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WaitSpec").field(&self.name()).finish()
    }
}

macro_rules! impl_from_strategy {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for WaitSpec {
                fn from(s: $ty) -> Self {
                    WaitSpec::$variant(s)
                }
            }
        )*
    };
}

impl_from_strategy! {
    Log => LogStrategy,
    Port => PortStrategy,
    Http => HttpStrategy,
    Exec => ExecStrategy,
    Health => HealthStrategy,
    Exit => ExitStrategy,
    Predicate => PredicateStrategy,
    All => AllStrategy,
}

#[cfg(feature = "postgres")]
impl_from_strategy! { Sql => SqlStrategy }

/// Block until `spec` is satisfied for `target`.
///
/// The resource is never terminated here; on failure the caller still owns it.
pub async fn wait_until_ready(
    ctx: &WaitContext,
    target: &dyn WaitTarget,
    spec: &WaitSpec,
    defaults: &WaitDefaults,
) -> Result<()> {
    let start = Instant::now();
    tracing::debug!(container_id = %target.id(), strategy = %spec.name(), "Waiting for readiness");
    let result = evaluate(ctx, target, spec, defaults).await;
    match &result {
        Ok(()) => tracing::info!(
            container_id = %target.id(),
            strategy = %spec.name(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Resource ready"
        ),
        Err(e) => tracing::warn!(container_id = %target.id(), error = %e, "Readiness check failed"),
    }
    result
}

pub(crate) fn evaluate<'a>(
    ctx: &'a WaitContext,
    target: &'a dyn WaitTarget,
    spec: &'a WaitSpec,
    defaults: &'a WaitDefaults,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        match spec {
            WaitSpec::All(all) => all.run(ctx, target, defaults).await,
            _ => match spec.as_leaf() {
                Some(leaf) => run_leaf(ctx, target, leaf, defaults).await,
                None => Ok(()),
            },
        }
    })
}

/// Drive one leaf until ready, fatal, timed out or cancelled.
async fn run_leaf(
    ctx: &WaitContext,
    target: &dyn WaitTarget,
    leaf: &dyn Strategy,
    defaults: &WaitDefaults,
) -> Result<()> {
    let strategy = leaf.name();
    let interval = leaf.poll_interval().unwrap_or(defaults.poll_interval);
    let start = Instant::now();
    let mut deadline = start + leaf.timeout().unwrap_or(defaults.startup_timeout);
    if let Some(outer) = ctx.deadline {
        deadline = deadline.min(outer);
    }

    let mut poller = leaf.poller().map_err(|source| WaitError::Fatal {
        strategy: strategy.clone(),
        elapsed: start.elapsed(),
        source,
    })?;
    let mut last_error: Option<String> = None;

    loop {
        let attempt = async {
            if leaf.requires_running() {
                ensure_running(target).await?;
            }
            poller.poll(target).await
        };

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return Err(WaitError::Cancelled { strategy, elapsed: start.elapsed() });
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(WaitError::Timeout { strategy, elapsed: start.elapsed(), last_error });
            }
            outcome = attempt => outcome,
        };

        match outcome {
            Ok(true) => {
                tracing::debug!(strategy = %strategy, elapsed_ms = start.elapsed().as_millis() as u64, "Strategy satisfied");
                return Ok(());
            }
            Ok(false) => {}
            Err(ProbeError::Transient(reason)) => {
                tracing::trace!(strategy = %strategy, reason = %reason, "Not ready yet");
                last_error = Some(reason);
            }
            Err(source) => {
                return Err(WaitError::Fatal {
                    strategy,
                    elapsed: start.elapsed(),
                    source,
                });
            }
        }

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return Err(WaitError::Cancelled { strategy, elapsed: start.elapsed() });
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(WaitError::Timeout { strategy, elapsed: start.elapsed(), last_error });
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Fatal if the resource has stopped for good.
async fn ensure_running(target: &dyn WaitTarget) -> std::result::Result<(), ProbeError> {
    match target.inspect().await {
        Ok(inspect) if inspect.status.is_terminal() => Err(ProbeError::fatal(format!(
            "container {} is {} (exit code {})",
            target.id(),
            inspect.status.as_str(),
            inspect
                .exit_code
                .map_or_else(|| "unknown".to_string(), |c| c.to_string())
        ))),
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Err(ProbeError::fatal(e)),
        Err(e) => Err(ProbeError::transient(e)),
    }
}

/// Map an engine error raised during a probe: a vanished resource is fatal,
/// anything else is retried.
pub(crate) fn classify_engine_error(err: EngineError) -> ProbeError {
    if err.is_not_found() {
        ProbeError::fatal(err)
    } else {
        ProbeError::transient(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;

    #[tokio::test]
    async fn test_mapped_port_on_host_network_is_the_container_port() {
        let engine = Arc::new(FakeEngine::new());
        let id = engine.add_running("pg");
        let target = Target::new(engine.clone(), id.clone());

        let err = target.mapped_port(ContainerPort::tcp(5432)).await.unwrap_err();
        assert!(matches!(err, EngineError::PortNotMapped { .. }));

        engine.use_host_network(&id);
        assert_eq!(target.mapped_port(ContainerPort::tcp(5432)).await.unwrap(), 5432);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_returns_within_one_interval() {
        let engine = Arc::new(FakeEngine::new());
        let id = engine.add_running("c1");
        let target = Target::new(engine.clone(), id.clone());
        let spec = WaitSpec::all([
            WaitSpec::for_log("never"),
            WaitSpec::for_log("also never"),
            WaitSpec::for_exec(["false"]),
        ]);
        engine.set_exec_result(&id, &["false"], 1);

        let ctx = WaitContext::default();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            cancel.cancel();
        });

        let start = Instant::now();
        let err = wait_until_ready(&ctx, &target, &spec, &WaitDefaults::default())
            .await
            .unwrap_err();
        assert!(err.is_cancelled(), "unexpected error: {err}");
        assert!(start.elapsed() < Duration::from_millis(3500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outer_deadline_bounds_leaf_timeout() {
        let engine = Arc::new(FakeEngine::new());
        let id = engine.add_running("c1");
        let target = Target::new(engine.clone(), id);
        let spec = WaitSpec::Log(LogStrategy::new("ready").with_startup_timeout(Duration::from_secs(30)));

        let ctx = WaitContext::default().with_timeout(Duration::from_secs(2));
        let start = Instant::now();
        let err = wait_until_ready(&ctx, &target, &spec, &WaitDefaults::default())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() <= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exited_resource_is_fatal() {
        let engine = Arc::new(FakeEngine::new());
        let id = engine.add_running("c1");
        engine.exit(&id, 1);
        let target = Target::new(engine.clone(), id);

        let err = wait_until_ready(
            &WaitContext::default(),
            &target,
            &WaitSpec::for_log("ready"),
            &WaitDefaults::default(),
        )
        .await
        .unwrap_err();
        match err {
            WaitError::Fatal { source, .. } => assert!(source.to_string().contains("exit code 1")),
            other => panic!("expected fatal, got {other}"),
        }
    }

    #[test]
    fn test_spec_names() {
        assert_eq!(WaitSpec::for_healthcheck().name(), "healthcheck");
        assert_eq!(
            WaitSpec::all([WaitSpec::for_exit(), WaitSpec::for_listening_port(80u16)]).name(),
            "all(exit, port(80/tcp))"
        );
    }
}
