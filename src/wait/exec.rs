use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::wait::{Poller, ProbeError, Strategy, Timing, WaitTarget, timing_builders};

type ExitMatcher = Arc<dyn Fn(i64) -> bool + Send + Sync>;
type OutputMatcher = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Ready once a command run inside the resource exits with a matching code.
#[derive(Clone)]
pub struct ExecStrategy {
    cmd: Vec<String>,
    exit_code: ExitMatcher,
    output: Option<OutputMatcher>,
    timing: Timing,
}

impl ExecStrategy {
    pub fn new<S: Into<String>>(cmd: impl IntoIterator<Item = S>) -> Self {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            exit_code: Arc::new(|code| code == 0),
            output: None,
            timing: Timing::default(),
        }
    }

    pub fn with_exit_code(mut self, matcher: impl Fn(i64) -> bool + Send + Sync + 'static) -> Self {
        self.exit_code = Arc::new(matcher);
        self
    }

    /// Also require stdout to satisfy `matcher`.
    pub fn with_output(mut self, matcher: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.output = Some(Arc::new(matcher));
        self
    }
}

timing_builders!(ExecStrategy);

impl Strategy for ExecStrategy {
    fn name(&self) -> String {
        format!("exec({})", self.cmd.join(" "))
    }

    fn timeout(&self) -> Option<Duration> {
        self.timing.timeout
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.timing.poll_interval
    }

    fn poller(&self) -> Result<Box<dyn Poller + '_>, ProbeError> {
        if self.cmd.is_empty() {
            return Err(ProbeError::fatal("empty command"));
        }
        Ok(Box::new(ExecPoller { strategy: self }))
    }
}

struct ExecPoller<'a> {
    strategy: &'a ExecStrategy,
}

#[async_trait]
impl Poller for ExecPoller<'_> {
    async fn poll(&mut self, target: &dyn WaitTarget) -> Result<bool, ProbeError> {
        let output = target
            .engine()
            .exec(target.id(), &self.strategy.cmd)
            .await
            .map_err(crate::wait::classify_engine_error)?;

        if !(self.strategy.exit_code)(output.exit_code) {
            return Err(ProbeError::transient(format!(
                "command exited with {}",
                output.exit_code
            )));
        }
        if let Some(matcher) = &self.strategy.output
            && !matcher(&output.stdout)
        {
            return Err(ProbeError::transient("command output did not match"));
        }
        Ok(true)
    }
}
