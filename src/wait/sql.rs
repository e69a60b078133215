use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::NoTls;

use crate::engine::ContainerPort;
use crate::wait::{Poller, ProbeError, Strategy, Timing, WaitTarget, classify_engine_error, timing_builders};

type DsnBuilder = Arc<dyn Fn(&str, u16) -> String + Send + Sync>;

const DEFAULT_QUERY: &str = "SELECT 1";

/// Ready once a PostgreSQL connection can be opened and a query runs.
///
/// Returned rows are ignored. Connection failures are retried; a query the
/// server rejects as invalid aborts immediately.
#[derive(Clone)]
pub struct SqlStrategy {
    port: ContainerPort,
    dsn: DsnBuilder,
    query: String,
    timing: Timing,
}

impl SqlStrategy {
    /// `dsn` builds a connection string from the mapped host and port.
    pub fn new(
        port: impl Into<ContainerPort>,
        dsn: impl Fn(&str, u16) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            port: port.into(),
            dsn: Arc::new(dsn),
            query: DEFAULT_QUERY.to_string(),
            timing: Timing::default(),
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }
}

timing_builders!(SqlStrategy);

impl Strategy for SqlStrategy {
    fn name(&self) -> String {
        format!("sql({})", self.port)
    }

    fn timeout(&self) -> Option<Duration> {
        self.timing.timeout
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.timing.poll_interval
    }

    fn poller(&self) -> Result<Box<dyn Poller + '_>, ProbeError> {
        if self.query.trim().is_empty() {
            return Err(ProbeError::fatal("empty readiness query"));
        }
        Ok(Box::new(SqlPoller { strategy: self }))
    }
}

/// Classify a SQLSTATE code. Class 42 (syntax error or access rule
/// violation) and class 0A (feature not supported) mean the query itself is
/// wrong; everything else may clear up once the server finishes starting.
pub fn classify_state(code: &str, message: impl ToString) -> ProbeError {
    if code.starts_with("42") || code.starts_with("0A") {
        ProbeError::fatal(format!("query rejected ({code}): {}", message.to_string()))
    } else {
        ProbeError::transient(format!("server error ({code}): {}", message.to_string()))
    }
}

fn classify(err: tokio_postgres::Error) -> ProbeError {
    match err.as_db_error() {
        Some(db) => classify_state(db.code().code(), db.message()),
        None => ProbeError::transient(err),
    }
}

struct SqlPoller<'a> {
    strategy: &'a SqlStrategy,
}

#[async_trait]
impl Poller for SqlPoller<'_> {
    async fn poll(&mut self, target: &dyn WaitTarget) -> Result<bool, ProbeError> {
        let s = self.strategy;
        let host = target.host().await.map_err(classify_engine_error)?;
        let port = match target.mapped_port(s.port).await {
            Ok(port) => port,
            Err(e) => return Err(classify_engine_error(e)),
        };

        let config: tokio_postgres::Config = (s.dsn)(&host, port)
            .parse()
            .map_err(|e| ProbeError::fatal(format!("invalid connection string: {e}")))?;

        let (client, connection) = config.connect(NoTls).await.map_err(classify)?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::trace!("Readiness connection closed: {}", e);
            }
        });

        let result = client.simple_query(&s.query).await;
        drop(client);
        driver.abort();

        result.map(|_| true).map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_state() {
        assert!(classify_state("42601", "syntax error").is_fatal());
        assert!(classify_state("42P01", "relation does not exist").is_fatal());
        assert!(!classify_state("57P03", "the database system is starting up").is_fatal());
        assert!(!classify_state("08006", "connection failure").is_fatal());
    }

    #[test]
    fn test_empty_query_is_fatal() {
        let s = SqlStrategy::new(5432u16, |h, p| format!("host={h} port={p}")).with_query("  ");
        assert!(matches!(s.poller(), Err(ProbeError::Fatal(_))));
    }
}
