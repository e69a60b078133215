use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::wait::{Poller, ProbeError, Strategy, Timing, WaitTarget, timing_builders};

type ExitMatcher = Arc<dyn Fn(i64) -> bool + Send + Sync>;

/// Ready once the main process has exited, optionally with a matching code.
/// Useful for one-shot jobs such as migrations.
#[derive(Clone, Default)]
pub struct ExitStrategy {
    exit_code: Option<ExitMatcher>,
    timing: Timing,
}

impl ExitStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exit_code(mut self, matcher: impl Fn(i64) -> bool + Send + Sync + 'static) -> Self {
        self.exit_code = Some(Arc::new(matcher));
        self
    }
}

timing_builders!(ExitStrategy);

impl Strategy for ExitStrategy {
    fn name(&self) -> String {
        "exit".to_string()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timing.timeout
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.timing.poll_interval
    }

    fn requires_running(&self) -> bool {
        false
    }

    fn poller(&self) -> Result<Box<dyn Poller + '_>, ProbeError> {
        Ok(Box::new(ExitPoller { strategy: self }))
    }
}

struct ExitPoller<'a> {
    strategy: &'a ExitStrategy,
}

#[async_trait]
impl Poller for ExitPoller<'_> {
    async fn poll(&mut self, target: &dyn WaitTarget) -> Result<bool, ProbeError> {
        let inspect = match target.inspect().await {
            Ok(inspect) => inspect,
            // Auto-removed after exiting.
            Err(e) if e.is_not_found() => {
                return match self.strategy.exit_code {
                    None => Ok(true),
                    Some(_) => Err(ProbeError::fatal(
                        "container was removed before its exit code could be read",
                    )),
                };
            }
            Err(e) => return Err(ProbeError::transient(e)),
        };

        if !inspect.status.is_terminal() {
            return Err(ProbeError::transient(format!(
                "container is {}",
                inspect.status.as_str()
            )));
        }

        match (&self.strategy.exit_code, inspect.exit_code) {
            (None, _) => Ok(true),
            (Some(matcher), Some(code)) if matcher(code) => Ok(true),
            (Some(_), code) => Err(ProbeError::fatal(format!(
                "container exited with unexpected code {}",
                code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
            ))),
        }
    }
}
