use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::wait::{Poller, ProbeError, Strategy, Timing, WaitTarget, timing_builders};

type Check =
    Arc<dyn for<'a> Fn(&'a dyn WaitTarget) -> BoxFuture<'a, Result<bool, ProbeError>> + Send + Sync>;

/// Caller-supplied readiness check. The closure classifies its own failures.
///
/// ```ignore
/// let spec = WaitSpec::from(PredicateStrategy::new("schema loaded", |target| {
///     Box::pin(async move {
///         let out = target.engine().exec(target.id(), &cmd).await
///             .map_err(ProbeError::transient)?;
///         Ok(out.stdout.contains("ok"))
///     })
/// }));
/// ```
#[derive(Clone)]
pub struct PredicateStrategy {
    name: String,
    check: Check,
    timing: Timing,
}

impl PredicateStrategy {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: for<'a> Fn(&'a dyn WaitTarget) -> BoxFuture<'a, Result<bool, ProbeError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(check),
            timing: Timing::default(),
        }
    }
}

timing_builders!(PredicateStrategy);

impl Strategy for PredicateStrategy {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timing.timeout
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.timing.poll_interval
    }

    fn poller(&self) -> Result<Box<dyn Poller + '_>, ProbeError> {
        Ok(Box::new(PredicatePoller { strategy: self }))
    }
}

struct PredicatePoller<'a> {
    strategy: &'a PredicateStrategy,
}

#[async_trait]
impl Poller for PredicatePoller<'_> {
    async fn poll(&mut self, target: &dyn WaitTarget) -> Result<bool, ProbeError> {
        (self.strategy.check)(target).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::config::WaitDefaults;
    use crate::testing::FakeEngine;
    use crate::wait::{Target, WaitContext, WaitSpec, wait_until_ready};

    #[tokio::test(start_paused = true)]
    async fn test_predicate_polled_until_true() {
        let engine = Arc::new(FakeEngine::new());
        let id = engine.add_running("c1");
        let target = Target::new(engine.clone(), id);

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let spec = WaitSpec::from(PredicateStrategy::new("third time lucky", move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move { Ok(n >= 3) })
        }));

        wait_until_ready(&WaitContext::default(), &target, &spec, &WaitDefaults::default())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_fatal_aborts() {
        let engine = Arc::new(FakeEngine::new());
        let id = engine.add_running("c1");
        let target = Target::new(engine.clone(), id);
        let spec = WaitSpec::from(PredicateStrategy::new("broken", |_| {
            Box::pin(async { Err(ProbeError::fatal("bad config")) })
        }));

        let err = wait_until_ready(&WaitContext::default(), &target, &spec, &WaitDefaults::default())
            .await
            .unwrap_err();
        assert_eq!(err.failed_strategies(), vec!["broken"]);
        assert!(err.to_string().contains("bad config"));
    }
}
