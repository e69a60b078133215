use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::engine::{ContainerPort, Protocol};
use crate::wait::{Poller, ProbeError, Strategy, Timing, WaitTarget, classify_engine_error, timing_builders};

/// Exit status of `/bin/sh` when the shell binary cannot be executed.
const SHELL_NOT_EXECUTABLE: i64 = 126;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Ready once a TCP dial to the host binding of a port succeeds.
///
/// With [`with_internal_check`](Self::with_internal_check) it additionally
/// verifies, via exec, that something inside the container is listening.
/// Some engines accept host connections on a published port before the
/// process behind it is up.
#[derive(Clone)]
pub struct PortStrategy {
    /// `None` targets the lowest exposed TCP port.
    port: Option<ContainerPort>,
    internal_check: bool,
    dial_timeout: Duration,
    timing: Timing,
}

impl PortStrategy {
    pub fn new(port: impl Into<ContainerPort>) -> Self {
        Self {
            port: Some(port.into()),
            internal_check: false,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            timing: Timing::default(),
        }
    }

    /// Target whichever exposed TCP port has the lowest number.
    pub fn lowest_exposed() -> Self {
        Self {
            port: None,
            internal_check: false,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            timing: Timing::default(),
        }
    }

    pub fn with_internal_check(mut self) -> Self {
        self.internal_check = true;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }
}

timing_builders!(PortStrategy);

impl Strategy for PortStrategy {
    fn name(&self) -> String {
        match self.port {
            Some(port) => format!("port({port})"),
            None => "port(lowest exposed)".to_string(),
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.timing.timeout
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.timing.poll_interval
    }

    fn poller(&self) -> Result<Box<dyn Poller + '_>, ProbeError> {
        if let Some(port) = self.port
            && port.protocol != Protocol::Tcp
        {
            return Err(ProbeError::fatal(format!(
                "cannot probe {port}: only tcp ports can be dialled"
            )));
        }
        Ok(Box::new(PortPoller { strategy: self }))
    }
}

struct PortPoller<'a> {
    strategy: &'a PortStrategy,
}

/// Shell snippet that succeeds when something listens on `port` inside the
/// container. Tries `/proc/net/tcp*`, then `nc`, then bash's `/dev/tcp`.
fn internal_check_command(port: u16) -> Vec<String> {
    let script = format!(
        "true && (\
         cat /proc/net/tcp* | awk '{{print $2}}' | grep -i ':{port:04x}' || \
         nc -vz -w 1 localhost {port} || \
         /bin/sh -c '</dev/tcp/localhost/{port}'\
         )"
    );
    vec!["/bin/sh".to_string(), "-c".to_string(), script]
}

#[async_trait]
impl Poller for PortPoller<'_> {
    async fn poll(&mut self, target: &dyn WaitTarget) -> Result<bool, ProbeError> {
        let inspect = target.inspect().await.map_err(classify_engine_error)?;
        let port = match self.strategy.port {
            Some(port) => port,
            None => inspect
                .lowest_bound_port(Some(Protocol::Tcp))
                .ok_or_else(|| ProbeError::transient("no exposed tcp port is mapped yet"))?,
        };

        // Host-network containers have no bindings; the port is the port.
        let host_port = if inspect.host_network {
            port.port
        } else {
            inspect
                .binding(port)
                .map(|b| b.host_port)
                .ok_or_else(|| ProbeError::transient(format!("port {port} not mapped yet")))?
        };
        let host = target.host().await.map_err(classify_engine_error)?;

        match tokio::time::timeout(
            self.strategy.dial_timeout,
            TcpStream::connect((host.as_str(), host_port)),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(ProbeError::transient(format!(
                    "dial {host}:{host_port}: {e}"
                )));
            }
            Err(_) => {
                return Err(ProbeError::transient(format!(
                    "dial {host}:{host_port}: timed out"
                )));
            }
        }

        if !self.strategy.internal_check {
            return Ok(true);
        }

        let output = target
            .engine()
            .exec(target.id(), &internal_check_command(port.port))
            .await
            .map_err(classify_engine_error)?;
        match output.exit_code {
            0 => Ok(true),
            SHELL_NOT_EXECUTABLE => {
                tracing::debug!(
                    container_id = %target.id(),
                    "No usable shell in container, trusting external port check"
                );
                Ok(true)
            }
            code => Err(ProbeError::transient(format!(
                "port {port} not listening inside container (check exited {code})"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::net::TcpListener;

    use super::*;
    use crate::testing::FakeEngine;
    use crate::wait::Target;

    #[test]
    fn test_internal_check_uses_hex_port() {
        let cmd = internal_check_command(5432);
        assert_eq!(cmd[0], "/bin/sh");
        assert!(cmd[2].contains(":1538"));
        assert!(cmd[2].contains("localhost 5432"));
    }

    #[test]
    fn test_udp_port_is_rejected() {
        assert!(PortStrategy::new(ContainerPort::udp(53)).poller().is_err());
    }

    #[tokio::test]
    async fn test_ready_when_listener_accepts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host_port = listener.local_addr().unwrap().port();

        let engine = Arc::new(FakeEngine::new());
        let id = engine.add_running("c1");
        engine.map_port(&id, ContainerPort::tcp(80), host_port);
        let target = Target::new(engine.clone(), id);

        let strategy = PortStrategy::new(80u16);
        let mut poller = strategy.poller().unwrap();
        assert_eq!(poller.poll(&target).await, Ok(true));
    }

    #[tokio::test]
    async fn test_unmapped_and_refused_are_transient() {
        let engine = Arc::new(FakeEngine::new());
        let id = engine.add_running("c1");
        let target = Target::new(engine.clone(), id.clone());

        let strategy = PortStrategy::new(80u16);
        let mut poller = strategy.poller().unwrap();
        assert!(matches!(poller.poll(&target).await, Err(ProbeError::Transient(_))));

        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        engine.map_port(&id, ContainerPort::tcp(80), port);
        assert!(matches!(poller.poll(&target).await, Err(ProbeError::Transient(_))));
    }

    #[tokio::test]
    async fn test_internal_check_shell_missing_trusts_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host_port = listener.local_addr().unwrap().port();

        let engine = Arc::new(FakeEngine::new());
        let id = engine.add_running("c1");
        engine.map_port(&id, ContainerPort::tcp(80), host_port);
        engine.set_default_exec_result(&id, SHELL_NOT_EXECUTABLE);
        let target = Target::new(engine.clone(), id);

        let strategy = PortStrategy::new(80u16).with_internal_check();
        let mut poller = strategy.poller().unwrap();
        assert_eq!(poller.poll(&target).await, Ok(true));
    }
}
