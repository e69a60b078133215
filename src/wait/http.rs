use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;

use crate::engine::{ContainerPort, Protocol};
use crate::wait::{Poller, ProbeError, Strategy, Timing, WaitTarget, classify_engine_error, timing_builders};

type StatusMatcher = Arc<dyn Fn(u16) -> bool + Send + Sync>;
type BodyMatcher = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Ready once an HTTP request returns a matching status (and body).
#[derive(Clone)]
pub struct HttpStrategy {
    path: String,
    /// `None` targets the lowest exposed TCP port.
    port: Option<ContainerPort>,
    method: String,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
    basic_auth: Option<(String, Option<String>)>,
    tls: bool,
    insecure_skip_verify: bool,
    status: StatusMatcher,
    body_matcher: Option<BodyMatcher>,
    request_timeout: Duration,
    timing: Timing,
}

impl HttpStrategy {
    /// `GET path`, expecting 200.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            port: None,
            method: "GET".to_string(),
            headers: Vec::new(),
            body: None,
            basic_auth: None,
            tls: false,
            insecure_skip_verify: false,
            status: Arc::new(|code| code == 200),
            body_matcher: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            timing: Timing::default(),
        }
    }

    pub fn with_port(mut self, port: impl Into<ContainerPort>) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_basic_auth(mut self, user: impl Into<String>, password: Option<String>) -> Self {
        self.basic_auth = Some((user.into(), password));
        self
    }

    /// Use `https`. With `insecure_skip_verify`, self-signed certificates are
    /// accepted.
    pub fn with_tls(mut self, insecure_skip_verify: bool) -> Self {
        self.tls = true;
        self.insecure_skip_verify = insecure_skip_verify;
        self
    }

    pub fn with_status(mut self, matcher: impl Fn(u16) -> bool + Send + Sync + 'static) -> Self {
        self.status = Arc::new(matcher);
        self
    }

    pub fn with_body_matcher(
        mut self,
        matcher: impl Fn(&[u8]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.body_matcher = Some(Arc::new(matcher));
        self
    }

    /// Per-request timeout; a slow response counts as not ready.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn url(&self, host: &str, port: u16) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.to_string()
        };
        let path = self.path.trim_start_matches('/');
        format!("{scheme}://{host}:{port}/{path}")
    }
}

timing_builders!(HttpStrategy);

impl Strategy for HttpStrategy {
    fn name(&self) -> String {
        match self.port {
            Some(port) => format!("http({} {} on {port})", self.method, self.path),
            None => format!("http({} {})", self.method, self.path),
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.timing.timeout
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.timing.poll_interval
    }

    fn poller(&self) -> Result<Box<dyn Poller + '_>, ProbeError> {
        let method = Method::from_bytes(self.method.as_bytes())
            .map_err(|e| ProbeError::fatal(format!("invalid method '{}': {e}", self.method)))?;
        if let Some(port) = self.port
            && port.protocol != Protocol::Tcp
        {
            return Err(ProbeError::fatal(format!("cannot send http to {port}")));
        }

        let client = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .danger_accept_invalid_certs(self.insecure_skip_verify)
            .build()
            .map_err(|e| ProbeError::fatal(format!("failed to build http client: {e}")))?;

        Ok(Box::new(HttpPoller {
            strategy: self,
            client,
            method,
        }))
    }
}

struct HttpPoller<'a> {
    strategy: &'a HttpStrategy,
    client: reqwest::Client,
    method: Method,
}

#[async_trait]
impl Poller for HttpPoller<'_> {
    async fn poll(&mut self, target: &dyn WaitTarget) -> Result<bool, ProbeError> {
        let s = self.strategy;
        let inspect = target.inspect().await.map_err(classify_engine_error)?;
        let port = match s.port {
            Some(port) => port,
            None => inspect
                .lowest_bound_port(Some(Protocol::Tcp))
                .ok_or_else(|| ProbeError::transient("no exposed tcp port is mapped yet"))?,
        };
        let host_port = if inspect.host_network {
            port.port
        } else {
            inspect
                .binding(port)
                .map(|b| b.host_port)
                .ok_or_else(|| ProbeError::transient(format!("port {port} not mapped yet")))?
        };
        let host = target.host().await.map_err(classify_engine_error)?;
        let url = s.url(&host, host_port);

        let mut request = self.client.request(self.method.clone(), &url);
        for (name, value) in &s.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &s.body {
            request = request.body(body.clone());
        }
        if let Some((user, password)) = &s.basic_auth {
            request = request.basic_auth(user, password.as_ref());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                ProbeError::fatal(format!("invalid request to {url}: {e}"))
            } else {
                ProbeError::transient(format!("{url}: {e}"))
            }
        })?;

        let status = response.status().as_u16();
        if !(s.status)(status) {
            return Err(ProbeError::transient(format!(
                "{url} returned unexpected status {status}"
            )));
        }

        if let Some(matcher) = &s.body_matcher {
            let body = response
                .bytes()
                .await
                .map_err(|e| ProbeError::transient(format!("{url}: reading body: {e}")))?;
            if !matcher(&body) {
                return Err(ProbeError::transient(format!(
                    "{url} body did not match ({} bytes)",
                    body.len()
                )));
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let s = HttpStrategy::new("/health");
        assert_eq!(s.url("localhost", 8080), "http://localhost:8080/health");
        let s = HttpStrategy::new("ready").with_tls(true);
        assert_eq!(s.url("::1", 8443), "https://[::1]:8443/ready");
    }

    #[test]
    fn test_invalid_method_is_fatal() {
        let s = HttpStrategy::new("/").with_method("GE T");
        assert!(matches!(s.poller(), Err(ProbeError::Fatal(_))));
    }

    #[test]
    fn test_name_mentions_method_and_path() {
        let s = HttpStrategy::new("/ping").with_method("HEAD").with_port(9000u16);
        assert_eq!(s.name(), "http(HEAD /ping on 9000/tcp)");
    }
}
