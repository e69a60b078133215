use std::fmt;

use async_trait::async_trait;
use regex::Regex;

use crate::error::ConfigError;
use crate::wait::{Poller, ProbeError, Strategy, Timing, WaitTarget, classify_engine_error, timing_builders};

/// What the log strategy looks for.
#[derive(Clone)]
enum Pattern {
    Substring(String),
    Regex(Regex),
}

impl Pattern {
    fn count(&self, text: &str) -> usize {
        match self {
            Pattern::Substring(s) => text.matches(s.as_str()).count(),
            Pattern::Regex(re) => re.find_iter(text).count(),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Substring(s) => write!(f, "{s:?}"),
            Pattern::Regex(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

/// Ready once a pattern has appeared in the log output a given number of
/// times.
///
/// Output is fetched incrementally by byte offset and only complete lines are
/// scanned, so a match is counted exactly once no matter how many polls
/// observe it. A log that shrinks (rotation, truncation) restarts the scan
/// from the new beginning without forgetting matches already counted.
#[derive(Clone)]
pub struct LogStrategy {
    pattern: Pattern,
    occurrences: usize,
    timing: Timing,
}

impl LogStrategy {
    /// Match `pattern` as a plain substring.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Pattern::Substring(pattern.into()),
            occurrences: 1,
            timing: Timing::default(),
        }
    }

    /// Match `pattern` as a regular expression.
    pub fn regex(pattern: &str) -> Result<Self, ConfigError> {
        let re = Regex::new(pattern).map_err(|e| ConfigError::InvalidValue {
            key: "log pattern".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            pattern: Pattern::Regex(re),
            occurrences: 1,
            timing: Timing::default(),
        })
    }

    /// Require `n` occurrences (values below 1 are treated as 1).
    pub fn with_occurrence(mut self, n: usize) -> Self {
        self.occurrences = n.max(1);
        self
    }
}

timing_builders!(LogStrategy);

impl Strategy for LogStrategy {
    fn name(&self) -> String {
        if self.occurrences > 1 {
            format!("log({} x{})", self.pattern, self.occurrences)
        } else {
            format!("log({})", self.pattern)
        }
    }

    fn timeout(&self) -> Option<std::time::Duration> {
        self.timing.timeout
    }

    fn poll_interval(&self) -> Option<std::time::Duration> {
        self.timing.poll_interval
    }

    fn poller(&self) -> Result<Box<dyn Poller + '_>, ProbeError> {
        Ok(Box::new(LogPoller {
            strategy: self,
            offset: 0,
            partial: Vec::new(),
            seen: 0,
        }))
    }
}

struct LogPoller<'a> {
    strategy: &'a LogStrategy,
    /// Next byte to request.
    offset: u64,
    /// Trailing bytes of an unterminated line.
    partial: Vec<u8>,
    seen: usize,
}

impl LogPoller<'_> {
    /// Feed newly received bytes; returns matches found in completed lines.
    fn consume(&mut self, data: &[u8]) -> usize {
        self.partial.extend_from_slice(data);
        let Some(end) = self.partial.iter().rposition(|b| *b == b'\n') else {
            return 0;
        };
        let complete: Vec<u8> = self.partial.drain(..=end).collect();
        self.strategy.pattern.count(&String::from_utf8_lossy(&complete))
    }
}

#[async_trait]
impl Poller for LogPoller<'_> {
    async fn poll(&mut self, target: &dyn WaitTarget) -> Result<bool, ProbeError> {
        let chunk = target
            .engine()
            .logs(target.id(), self.offset)
            .await
            .map_err(classify_engine_error)?;

        if chunk.offset < self.offset {
            tracing::debug!(
                container_id = %target.id(),
                expected = self.offset,
                got = chunk.offset,
                "Log restarted, rescanning from new offset"
            );
            self.partial.clear();
        }
        self.offset = chunk.next_offset();

        let found = self.consume(&chunk.combined());
        self.seen += found;

        if self.seen >= self.strategy.occurrences {
            return Ok(true);
        }
        Err(ProbeError::transient(format!(
            "pattern {} seen {} of {} time(s)",
            self.strategy.pattern, self.seen, self.strategy.occurrences
        )))
    }
}
