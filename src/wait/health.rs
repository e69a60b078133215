use std::time::Duration;

use async_trait::async_trait;

use crate::engine::HealthStatus;
use crate::wait::{Poller, ProbeError, Strategy, Timing, WaitTarget, classify_engine_error, timing_builders};

/// Ready once the engine's own health check reports `healthy`.
#[derive(Clone, Default)]
pub struct HealthStrategy {
    timing: Timing,
}

impl HealthStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

timing_builders!(HealthStrategy);

impl Strategy for HealthStrategy {
    fn name(&self) -> String {
        "healthcheck".to_string()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timing.timeout
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.timing.poll_interval
    }

    fn poller(&self) -> Result<Box<dyn Poller + '_>, ProbeError> {
        Ok(Box::new(HealthPoller))
    }
}

struct HealthPoller;

#[async_trait]
impl Poller for HealthPoller {
    async fn poll(&mut self, target: &dyn WaitTarget) -> Result<bool, ProbeError> {
        let inspect = target.inspect().await.map_err(classify_engine_error)?;
        match inspect.health {
            Some(HealthStatus::Healthy) => Ok(true),
            Some(HealthStatus::Starting) => Err(ProbeError::transient("health: starting")),
            Some(HealthStatus::Unhealthy) => Err(ProbeError::transient("health: unhealthy")),
            None => Err(ProbeError::fatal(format!(
                "container {} has no health check configured",
                target.id()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::FakeEngine;
    use crate::wait::Target;

    #[tokio::test]
    async fn test_health_transitions() {
        let engine = Arc::new(FakeEngine::new());
        let id = engine.add_running("c1");
        let target = Target::new(engine.clone(), id.clone());
        let mut poller = HealthPoller;

        assert!(matches!(poller.poll(&target).await, Err(ProbeError::Fatal(_))));

        engine.set_health(&id, Some(HealthStatus::Starting));
        assert!(matches!(poller.poll(&target).await, Err(ProbeError::Transient(_))));

        engine.set_health(&id, Some(HealthStatus::Healthy));
        assert_eq!(poller.poll(&target).await, Ok(true));
    }
}
