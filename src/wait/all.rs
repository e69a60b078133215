use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::time::Instant;

use crate::config::WaitDefaults;
use crate::wait::{Result, WaitContext, WaitError, WaitSpec, WaitTarget, evaluate};

/// Every child must succeed. Children are polled concurrently; the first
/// fatal failure cancels the rest.
#[derive(Clone, Debug)]
pub struct AllStrategy {
    children: Vec<WaitSpec>,
    /// Bounds every child in addition to their own timeouts.
    timeout: Option<Duration>,
}

impl AllStrategy {
    pub fn new(children: impl IntoIterator<Item = WaitSpec>) -> Self {
        Self {
            children: children.into_iter().collect(),
            timeout: None,
        }
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn children(&self) -> &[WaitSpec] {
        &self.children
    }

    pub fn name(&self) -> String {
        let names: Vec<String> = self.children.iter().map(WaitSpec::name).collect();
        format!("all({})", names.join(", "))
    }

    pub(crate) async fn run(
        &self,
        ctx: &WaitContext,
        target: &dyn WaitTarget,
        defaults: &WaitDefaults,
    ) -> Result<()> {
        let start = Instant::now();
        let mut group = ctx.child();
        if let Some(timeout) = self.timeout {
            group = group.with_deadline(start + timeout);
        }

        let mut running: FuturesUnordered<_> = self
            .children
            .iter()
            .map(|child| evaluate(&group, target, child, defaults))
            .collect();

        let mut failures = Vec::new();
        let mut aborted = false;
        while let Some(result) = running.next().await {
            let Err(err) = result else { continue };

            // Siblings we cancelled ourselves are not failures of their own.
            if aborted && err.is_cancelled() {
                continue;
            }
            if matches!(err, WaitError::Fatal { .. }) && !aborted {
                tracing::debug!(error = %err, "Fatal child failure, cancelling siblings");
                aborted = true;
                group.cancel.cancel();
            }
            failures.push(err);
        }

        if ctx.cancel.is_cancelled() {
            return Err(WaitError::Cancelled {
                strategy: self.name(),
                elapsed: start.elapsed(),
            });
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(WaitError::All { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::FakeEngine;
    use crate::wait::{ExitStrategy, LogStrategy, Target, WaitSpec, wait_until_ready};

    #[tokio::test(start_paused = true)]
    async fn test_never_ready_leaf_is_named_and_bounded() {
        let engine = Arc::new(FakeEngine::new());
        let id = engine.add_running("c1");
        engine.emit_log(&id, "ready\n");
        let target = Target::new(engine.clone(), id);

        let spec = WaitSpec::all([
            WaitSpec::Log(LogStrategy::new("ready").with_startup_timeout(Duration::from_secs(5))),
            WaitSpec::Log(
                LogStrategy::new("never printed").with_startup_timeout(Duration::from_secs(3)),
            ),
            WaitSpec::Exit(ExitStrategy::new().with_startup_timeout(Duration::from_secs(4))),
        ]);

        let start = Instant::now();
        let err = wait_until_ready(&WaitContext::default(), &target, &spec, &WaitDefaults::default())
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(elapsed <= Duration::from_secs(5), "took {elapsed:?}");
        let failed = err.failed_strategies();
        assert!(failed.contains(&"log(\"never printed\")"), "{failed:?}");
        assert!(failed.contains(&"exit"), "{failed:?}");
        assert!(!failed.contains(&"log(\"ready\")"), "{failed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_child_cancels_siblings() {
        let engine = Arc::new(FakeEngine::new());
        let id = engine.add_running("c1");
        let target = Target::new(engine.clone(), id);

        // No health check configured: fatal on the first poll.
        let spec = WaitSpec::all([WaitSpec::for_log("never"), WaitSpec::for_healthcheck()]);

        let start = Instant::now();
        let err = wait_until_ready(&WaitContext::default(), &target, &spec, &WaitDefaults::default())
            .await
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(err.failed_strategies(), vec!["healthcheck"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_children_ready() {
        let engine = Arc::new(FakeEngine::new());
        let id = engine.add_running("c1");
        engine.emit_log_after(&id, Duration::from_secs(2), "a\n");
        engine.emit_log_after(&id, Duration::from_secs(4), "b\n");
        let target = Target::new(engine.clone(), id);

        let spec = WaitSpec::all([WaitSpec::for_log("a"), WaitSpec::for_log("b")]);
        let start = Instant::now();
        wait_until_ready(&WaitContext::default(), &target, &spec, &WaitDefaults::default())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(4));
    }
}
