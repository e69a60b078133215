//! The reaper sidecar.
//!
//! Accepts registration connections, collects one filter set per connection
//! and, once every client has been gone for the reconnection grace period,
//! removes everything matching any registered set. If nobody connects at all
//! within the connection timeout the sidecar exits without pruning.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ReaperConfig;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::reaper::error::Result;
use crate::reaper::protocol::{ACK, ERR_PREFIX, Filter, FilterSet, MAX_LINE_LEN, parse_line};

/// Attempts to remove a network that still has endpoints attached.
const NETWORK_REMOVE_ATTEMPTS: u32 = 10;
const NETWORK_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Filter sets received so far, one per connection. Sets survive the
/// connection that registered them.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    sets: Arc<Mutex<HashMap<u64, FilterSet>>>,
}

impl Registry {
    fn extend(&self, connection: u64, filters: Vec<Filter>) {
        let mut sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        sets.entry(connection).or_default().extend(filters);
    }

    /// Distinct non-empty sets. Identical registrations from different
    /// connections collapse into one.
    pub fn sets(&self) -> HashSet<FilterSet> {
        self.sets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect()
    }
}

/// What a prune removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub containers: Vec<String>,
    pub networks: Vec<String>,
    /// `id: reason` for everything that could not be removed.
    pub failures: Vec<String>,
}

enum Event {
    Disconnected,
}

/// The sidecar server.
pub struct ReaperServer {
    engine: Arc<dyn Engine>,
    listener: TcpListener,
    registry: Registry,
    connection_timeout: Duration,
    reconnection_timeout: Duration,
}

impl ReaperServer {
    pub async fn bind(
        engine: Arc<dyn Engine>,
        config: &ReaperConfig,
        addr: SocketAddr,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            engine,
            listener,
            registry: Registry::default(),
            connection_timeout: config.connection_timeout,
            reconnection_timeout: config.reconnection_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Serve until the owners are gone, then prune. Returns `None` when the
    /// sidecar exits without pruning: nobody connected in time, or `shutdown`
    /// was cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<Option<PruneReport>> {
        let addr = self.local_addr()?;
        tracing::info!(addr = %addr, "Reaper listening");

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut connections = JoinSet::new();
        let mut next_id = 0u64;
        let mut active = 0usize;
        let mut idle_deadline = Instant::now() + self.connection_timeout;
        let mut ever_connected = false;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Reaper shutting down without pruning");
                    return Ok(None);
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    next_id += 1;
                    let id = next_id;
                    active += 1;
                    ever_connected = true;
                    tracing::debug!(peer = %peer, connection = id, active, "Client connected");
                    let registry = self.registry.clone();
                    let events_tx = events_tx.clone();
                    connections.spawn(async move {
                        if let Err(e) = serve_connection(stream, id, &registry).await {
                            tracing::debug!(connection = id, error = %e, "Connection ended with error");
                        }
                        let _ = events_tx.send(Event::Disconnected);
                    });
                }
                Some(Event::Disconnected) = events.recv() => {
                    active = active.saturating_sub(1);
                    tracing::debug!(active, "Client disconnected");
                    if active == 0 {
                        idle_deadline = Instant::now() + self.reconnection_timeout;
                    }
                }
                _ = tokio::time::sleep_until(idle_deadline), if active == 0 => {
                    if !ever_connected {
                        tracing::info!(
                            timeout_secs = self.connection_timeout.as_secs(),
                            "No client connected; exiting without pruning"
                        );
                        return Ok(None);
                    }
                    break;
                }
            }
        }

        drop(connections);
        let sets = self.registry.sets();
        tracing::info!(filter_sets = sets.len(), "All clients gone; pruning");
        Ok(Some(prune(self.engine.as_ref(), &sets).await))
    }
}

/// Read registration lines until EOF, answering each.
async fn serve_connection(stream: TcpStream, id: u64, registry: &Registry) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut buf = Vec::new();

    let limit = MAX_LINE_LEN as u64 + 2;
    loop {
        buf.clear();
        let n = (&mut reader).take(limit).read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        // An overlong line is rejected whole; its tail must not be read as
        // a line of its own.
        if n as u64 == limit && !buf.ends_with(b"\n") {
            skip_line(&mut reader).await?;
        }
        let line = String::from_utf8_lossy(&buf);
        let reply = match parse_line(&line) {
            Ok(filters) => {
                tracing::debug!(connection = id, line = %line.trim_end(), "Registered filters");
                registry.extend(id, filters);
                format!("{ACK}\n")
            }
            Err(e) => {
                tracing::debug!(connection = id, error = %e, "Rejected line");
                format!("{ERR_PREFIX} {e}\n")
            }
        };
        write.write_all(reply.as_bytes()).await?;
    }
}

/// Discard input up to and including the next newline (or EOF).
async fn skip_line(reader: &mut BufReader<OwnedReadHalf>) -> std::io::Result<()> {
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

/// Remove every container, then every network, matching any of `sets`.
pub async fn prune(engine: &dyn Engine, sets: &HashSet<FilterSet>) -> PruneReport {
    let mut report = PruneReport::default();

    let mut containers = BTreeSet::new();
    let mut networks = BTreeSet::new();
    for set in sets.iter().filter(|s| !s.is_empty()) {
        match engine.list_containers(set).await {
            Ok(ids) => containers.extend(ids),
            Err(e) => report.failures.push(format!("{set}: {e}")),
        }
        match engine.list_networks(set).await {
            Ok(ids) => networks.extend(ids),
            Err(e) => report.failures.push(format!("{set}: {e}")),
        }
    }

    for id in containers {
        match engine.remove_container(&id).await {
            Ok(()) => report.containers.push(id),
            Err(e) if e.is_not_found() => {}
            Err(e) => report.failures.push(format!("{id}: {e}")),
        }
    }

    for id in networks {
        match remove_network_with_retry(engine, &id).await {
            Ok(()) => report.networks.push(id),
            Err(e) if e.is_not_found() => {}
            Err(e) => report.failures.push(format!("{id}: {e}")),
        }
    }

    tracing::info!(
        containers = report.containers.len(),
        networks = report.networks.len(),
        failures = report.failures.len(),
        "Prune finished"
    );
    for failure in &report.failures {
        tracing::warn!("Prune failure: {}", failure);
    }
    report
}

/// A network can stay busy for a moment after its containers are removed.
async fn remove_network_with_retry(
    engine: &dyn Engine,
    id: &str,
) -> std::result::Result<(), EngineError> {
    let mut attempt = 1;
    loop {
        match engine.remove_network(id).await {
            Err(EngineError::Conflict { .. }) if attempt < NETWORK_REMOVE_ATTEMPTS => {
                tracing::debug!(network_id = %id, attempt, "Network still in use; retrying");
                attempt += 1;
                tokio::time::sleep(NETWORK_RETRY_DELAY).await;
            }
            other => return other,
        }
    }
}
