//! Reaper client.
//!
//! Lazily starts (or finds) the session's sidecar, opens one long-lived
//! connection to it and registers the session filter set. The socket is owned
//! by a single writer task; callers hand it lines over a channel and wait for
//! the matching acknowledgement, so concurrent registrations never interleave.
//!
//! ```text
//!   Disconnected ──► Connecting ──► Registered ──► Closed   (close())
//!         ▲               │              │
//!         └── dial fails ─┘              └───────► Lost     (sidecar went away)
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{ReaperConfig, WaitDefaults};
use crate::engine::{ContainerPort, ContainerSpec, ContainerStatus, Engine, Mount};
use crate::reaper::error::{ReaperError, Result};
use crate::reaper::protocol::{Filter, FilterSet, parse_reply};
use crate::session::{LABEL_REAPER, LABEL_SESSION_ID, Session};
use crate::wait::{PortStrategy, Target, WaitContext, WaitSpec, WaitTarget, wait_until_ready};

/// Engine socket mounted into the sidecar.
const DOCKER_SOCKET: &str = "/var/run/docker.sock";

const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const SIDECAR_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const SIDECAR_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connection state of a [`ReaperClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaperState {
    /// No connection yet, or the last attempt failed before registering.
    Disconnected,
    /// Starting the sidecar or dialling it.
    Connecting,
    /// Filters acknowledged; the connection is held open.
    Registered,
    /// Closed by this process.
    Closed,
    /// The sidecar dropped the connection or could not be reached again.
    Lost,
}

struct Shared {
    state: StdMutex<ReaperState>,
    generation: AtomicU64,
}

impl Shared {
    fn set(&self, state: ReaperState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn get(&self) -> ReaperState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark the connection of `generation` lost, unless it was replaced.
    fn lost(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) == generation {
            self.set(ReaperState::Lost);
        }
    }
}

struct Command {
    line: String,
    ack: oneshot::Sender<Result<()>>,
}

/// Handle to the writer task owning the socket. Dropping it closes the
/// connection.
struct Connection {
    tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl Connection {
    fn spawn(stream: TcpStream, shared: Arc<Shared>, generation: u64) -> Self {
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(own_socket(stream, rx, shared, generation));
        Self { tx, task }
    }

    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    async fn send(&self, line: String) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(Command { line, ack })
            .await
            .map_err(|_| ReaperError::ConnectionLost {
                reason: "connection task has stopped".to_string(),
            })?;
        rx.await.map_err(|_| ReaperError::ConnectionLost {
            reason: "connection task dropped the request".to_string(),
        })?
    }
}

/// The single writer: sends queued lines and matches replies to requests in
/// order.
async fn own_socket(
    stream: TcpStream,
    mut rx: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
    generation: u64,
) {
    let (read, mut write) = stream.into_split();
    let mut replies = BufReader::new(read).lines();
    let mut pending: VecDeque<oneshot::Sender<Result<()>>> = VecDeque::new();

    let reason = loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command { line, ack }) => {
                    let mut bytes = line.into_bytes();
                    bytes.push(b'\n');
                    if let Err(e) = write.write_all(&bytes).await {
                        let reason = e.to_string();
                        let _ = ack.send(Err(ReaperError::Io(e)));
                        break reason;
                    }
                    pending.push_back(ack);
                }
                None => {
                    let _ = write.shutdown().await;
                    return;
                }
            },
            reply = replies.next_line() => match reply {
                Ok(Some(line)) => match pending.pop_front() {
                    Some(ack) => {
                        let _ = ack.send(parse_reply(&line));
                    }
                    None => tracing::debug!(reply = %line, "Unsolicited reaper reply"),
                },
                Ok(None) => break "sidecar closed the connection".to_string(),
                Err(e) => break e.to_string(),
            },
        }
    };

    shared.lost(generation);
    tracing::warn!(reason = %reason, "Reaper connection lost");
    for ack in pending.drain(..) {
        let _ = ack.send(Err(ReaperError::ConnectionLost {
            reason: reason.clone(),
        }));
    }
}

/// Last dial failure, replayed to later callers instead of dialling again.
#[derive(Clone)]
struct Unreachable {
    endpoint: String,
    attempts: u32,
    reason: String,
}

impl From<Unreachable> for ReaperError {
    fn from(u: Unreachable) -> Self {
        ReaperError::Unavailable {
            endpoint: u.endpoint,
            attempts: u.attempts,
            reason: u.reason,
        }
    }
}

#[derive(Default)]
struct Inner {
    connection: Option<Connection>,
    sidecar: Option<String>,
    unreachable: Option<Unreachable>,
    registered_once: bool,
}

/// Client side of the reaper protocol, one per session.
pub struct ReaperClient {
    engine: Arc<dyn Engine>,
    config: ReaperConfig,
    session: Arc<Session>,
    endpoint: Option<String>,
    shared: Arc<Shared>,
    inner: Mutex<Inner>,
    warned: AtomicBool,
    degraded: StdMutex<Option<String>>,
}

impl std::fmt::Debug for ReaperClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaperClient")
            .field("session", &self.session.id())
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl ReaperClient {
    pub fn new(engine: Arc<dyn Engine>, config: ReaperConfig, session: Arc<Session>) -> Self {
        Self {
            engine,
            config,
            session,
            endpoint: None,
            shared: Arc::new(Shared {
                state: StdMutex::new(ReaperState::Disconnected),
                generation: AtomicU64::new(0),
            }),
            inner: Mutex::new(Inner::default()),
            warned: AtomicBool::new(false),
            degraded: StdMutex::new(None),
        }
    }

    /// Talk to a sidecar at `endpoint` (`host:port`) instead of starting one.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn state(&self) -> ReaperState {
        self.shared.get()
    }

    /// Why the session is running without crash-safe cleanup, once a
    /// degraded-mode warning has been issued.
    pub fn degraded(&self) -> Option<String> {
        self.degraded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Make sure the session's filters are registered with a live sidecar.
    ///
    /// Cheap once registered. After a failed dial the failure is replayed
    /// without dialling again.
    pub async fn ensure_registered(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        match self.state() {
            ReaperState::Closed => {
                return Err(ReaperError::ConnectionLost {
                    reason: "reaper client was closed".to_string(),
                });
            }
            ReaperState::Registered
                if inner.connection.as_ref().is_some_and(Connection::is_alive) =>
            {
                return Ok(());
            }
            _ => {}
        }
        if let Some(unreachable) = &inner.unreachable {
            return Err(unreachable.clone().into());
        }

        self.shared.set(ReaperState::Connecting);
        inner.connection = None;
        match self.connect_and_register(&mut inner).await {
            Ok(connection) => {
                inner.connection = Some(connection);
                inner.registered_once = true;
                self.shared.set(ReaperState::Registered);
                tracing::info!(session_id = %self.session.id(), "Registered session with reaper");
                Ok(())
            }
            Err(e) => {
                if let ReaperError::Unavailable {
                    endpoint,
                    attempts,
                    reason,
                } = &e
                {
                    inner.unreachable = Some(Unreachable {
                        endpoint: endpoint.clone(),
                        attempts: *attempts,
                        reason: reason.clone(),
                    });
                }
                self.shared.set(if inner.registered_once {
                    ReaperState::Lost
                } else {
                    ReaperState::Disconnected
                });
                Err(e)
            }
        }
    }

    /// Log the loss of crash safety. Only the first call per client warns;
    /// returns whether this call did.
    pub fn warn_degraded(&self, err: &ReaperError) -> bool {
        if self.warned.swap(true, Ordering::SeqCst) {
            tracing::debug!(error = %err, "Reaper still unavailable");
            return false;
        }
        *self.degraded.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());
        tracing::warn!(
            session_id = %self.session.id(),
            error = %err,
            "Reaper unavailable; resources of this session will not be removed if the process dies"
        );
        true
    }

    /// Close the connection. The sidecar prunes the session once its
    /// reconnection grace period expires.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(connection) = inner.connection.take() {
            let Connection { tx, task } = connection;
            drop(tx);
            let _ = tokio::time::timeout(DIAL_TIMEOUT, task).await;
        }
        self.shared.set(ReaperState::Closed);
        tracing::debug!(session_id = %self.session.id(), "Closed reaper connection");
    }

    async fn connect_and_register(&self, inner: &mut Inner) -> Result<Connection> {
        let endpoint = match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => self.sidecar_endpoint(inner).await?,
        };
        let stream = self.dial(&endpoint).await?;

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = Connection::spawn(stream, self.shared.clone(), generation);
        connection.send(self.session.filter_set().to_line()).await?;
        Ok(connection)
    }

    async fn dial(&self, endpoint: &str) -> Result<TcpStream> {
        let attempts = self.config.connect_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(endpoint)).await {
                Ok(Ok(stream)) => {
                    tracing::debug!(endpoint = %endpoint, attempt, "Connected to reaper");
                    return Ok(stream);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("no answer within {DIAL_TIMEOUT:?}"),
            }
            tracing::debug!(endpoint = %endpoint, attempt, error = %last_error, "Reaper dial failed");
            if attempt < attempts {
                tokio::time::sleep(self.backoff()).await;
            }
        }
        Err(ReaperError::Unavailable {
            endpoint: endpoint.to_string(),
            attempts,
            reason: last_error,
        })
    }

    /// Configured backoff plus up to a quarter of jitter.
    fn backoff(&self) -> Duration {
        let base = self.config.connect_backoff;
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter)
    }

    /// `host:port` of the sidecar, starting it if needed.
    async fn sidecar_endpoint(&self, inner: &mut Inner) -> Result<String> {
        let id = match &inner.sidecar {
            Some(id) => id.clone(),
            None => {
                let id = self.find_or_start_sidecar().await?;
                inner.sidecar = Some(id.clone());
                id
            }
        };

        let target = Target::new(self.engine.clone(), id.clone());
        let port = ContainerPort::tcp(self.config.port);
        let spec = WaitSpec::Port(PortStrategy::new(port));
        let defaults = WaitDefaults {
            startup_timeout: SIDECAR_STARTUP_TIMEOUT,
            poll_interval: SIDECAR_POLL_INTERVAL,
        };
        if let Err(e) = wait_until_ready(&WaitContext::default(), &target, &spec, &defaults).await {
            inner.sidecar = None;
            return Err(ReaperError::Unavailable {
                endpoint: id,
                attempts: 0,
                reason: e.to_string(),
            });
        }

        let host = self.engine.host().await?;
        let mapped = target.mapped_port(port).await?;
        Ok(format!("{host}:{mapped}"))
    }

    async fn find_or_start_sidecar(&self) -> Result<String> {
        let filters = FilterSet::new()
            .with(Filter::label(LABEL_REAPER, "true"))
            .with(Filter::label(LABEL_SESSION_ID, self.session.id()));
        if let Some(id) = self.engine.list_containers(&filters).await?.into_iter().next() {
            match self.engine.inspect_container(&id).await {
                Ok(inspect) if inspect.status == ContainerStatus::Running => {
                    tracing::debug!(container_id = %id, "Reusing reaper sidecar");
                    return Ok(id);
                }
                _ => {
                    tracing::debug!(container_id = %id, "Replacing stopped reaper sidecar");
                    let _ = self.engine.remove_container(&id).await;
                }
            }
        }

        self.engine.ensure_image(&self.config.image).await?;
        let spec = self.sidecar_spec();
        let id = self.engine.create_container(&spec).await?;
        self.engine.start_container(&id).await?;
        tracing::info!(container_id = %id, image = %self.config.image, "Started reaper sidecar");
        Ok(id)
    }

    fn sidecar_spec(&self) -> ContainerSpec {
        let env = BTreeMap::from([
            (
                "THROWAWAY_REAPER_PORT".to_string(),
                self.config.port.to_string(),
            ),
            (
                "THROWAWAY_REAPER_CONNECTION_TIMEOUT_SECS".to_string(),
                self.config.connection_timeout.as_secs().to_string(),
            ),
            (
                "THROWAWAY_REAPER_RECONNECTION_TIMEOUT_SECS".to_string(),
                self.config.reconnection_timeout.as_secs().to_string(),
            ),
        ]);
        let labels = BTreeMap::from([
            (LABEL_SESSION_ID.to_string(), self.session.id().to_string()),
            (LABEL_REAPER.to_string(), "true".to_string()),
        ]);
        ContainerSpec {
            name: Some(format!("throwaway-reaper-{}", self.session.id())),
            image: self.config.image.clone(),
            cmd: vec!["reaper".to_string()],
            env,
            exposed_ports: vec![ContainerPort::tcp(self.config.port)],
            mounts: vec![Mount::bind(DOCKER_SOCKET, DOCKER_SOCKET)],
            labels,
            privileged: self.config.privileged,
            auto_remove: true,
            ..Default::default()
        }
    }
}
