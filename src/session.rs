//! Session bookkeeping.
//!
//! A session is one test run. Every resource created through a
//! [`Provider`](crate::lifecycle::Provider) is stamped with the session's
//! labels and appended to its creation ledger, so that normal teardown can
//! remove containers before the networks they attach to, and the reaper can
//! find everything the session owns after a crash.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use uuid::Uuid;

use crate::engine::Engine;
use crate::lifecycle::TerminationError;
use crate::reaper::protocol::FilterSet;

/// Prefix reserved for labels this crate manages.
pub const LABEL_PREFIX: &str = "dev.throwaway";

/// Session id of the run that created a resource.
pub const LABEL_SESSION_ID: &str = "dev.throwaway.session-id";

/// Set to `true` on resources the reaper should remove.
pub const LABEL_REAP: &str = "dev.throwaway.reap";

/// Marks the reaper sidecar itself.
pub const LABEL_REAPER: &str = "dev.throwaway.reaper";

static GLOBAL: OnceLock<Arc<Session>> = OnceLock::new();

/// A resource recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tracked {
    Container(String),
    Network(String),
}

impl Tracked {
    pub fn id(&self) -> &str {
        match self {
            Tracked::Container(id) | Tracked::Network(id) => id,
        }
    }
}

/// One test run.
#[derive(Debug)]
pub struct Session {
    id: String,
    ledger: Mutex<Vec<Tracked>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// A session with a fresh random id.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ledger: Mutex::new(Vec::new()),
        }
    }

    /// The process-wide session, created on first use.
    pub fn global() -> Arc<Session> {
        GLOBAL
            .get_or_init(|| {
                let session = Arc::new(Session::new());
                tracing::debug!(session_id = %session.id, "Started session");
                session
            })
            .clone()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Labels stamped on every resource of this session.
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_SESSION_ID.to_string(), self.id.clone()),
            (LABEL_REAP.to_string(), "true".to_string()),
        ])
    }

    /// The reaper filter set selecting everything this session owns.
    pub fn filter_set(&self) -> FilterSet {
        FilterSet::from_labels(&self.labels())
    }

    pub fn track_container(&self, id: &str) {
        self.lock().push(Tracked::Container(id.to_string()));
    }

    pub fn track_network(&self, id: &str) {
        self.lock().push(Tracked::Network(id.to_string()));
    }

    /// Drop `id` from the ledger once it has been removed.
    pub fn forget(&self, id: &str) {
        self.lock().retain(|t| t.id() != id);
    }

    /// Ledger contents in creation order.
    pub fn tracked(&self) -> Vec<Tracked> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Tracked>> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove everything still in the ledger: containers newest first, then
    /// networks newest first. Resources that are already gone count as
    /// removed. Failures are collected; the rest of the teardown continues.
    pub async fn teardown(&self, engine: &dyn Engine, grace: Duration) -> Vec<TerminationError> {
        let tracked = std::mem::take(&mut *self.lock());
        let (containers, networks): (Vec<_>, Vec<_>) = tracked
            .into_iter()
            .rev()
            .partition(|t| matches!(t, Tracked::Container(_)));

        let mut failures = Vec::new();
        for t in containers {
            let id = t.id();
            if let Err(e) = engine.stop_container(id, grace).await
                && !e.is_not_found()
            {
                tracing::debug!(container_id = %id, error = %e, "Stop failed; removing anyway");
            }
            match engine.remove_container(id).await {
                Ok(()) => tracing::debug!(container_id = %id, "Removed container"),
                Err(e) if e.is_not_found() => {}
                Err(source) => failures.push(TerminationError {
                    resource_id: id.to_string(),
                    source,
                }),
            }
        }

        for t in networks {
            let id = t.id();
            match engine.remove_network(id).await {
                Ok(()) => tracing::debug!(network_id = %id, "Removed network"),
                Err(e) if e.is_not_found() => {}
                Err(source) => failures.push(TerminationError {
                    resource_id: id.to_string(),
                    source,
                }),
            }
        }

        for failure in &failures {
            tracing::warn!(session_id = %self.id, "{}", failure);
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ContainerSpec, NetworkSpec};
    use crate::testing::FakeEngine;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_filter_set_matches_own_labels_only() {
        let session = Session::with_id("s1");
        let set = session.filter_set();
        assert_eq!(
            set.to_line(),
            "label=dev.throwaway.reap=true&label=dev.throwaway.session-id=s1"
        );
        assert!(set.matches("x", None, &session.labels()));
        assert!(!set.matches("x", None, &Session::with_id("s2").labels()));
    }

    #[test]
    fn test_global_session_is_shared() {
        assert_eq!(Session::global().id(), Session::global().id());
    }

    #[test]
    fn test_concurrent_tracking_keeps_every_entry() {
        let session = Arc::new(Session::with_id("s"));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let session = session.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        session.track_container(&format!("c-{i}-{j}"));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(session.tracked().len(), 400);
    }

    #[tokio::test]
    async fn test_teardown_removes_containers_before_networks() {
        let engine = FakeEngine::new();
        let session = Session::with_id("s");

        let net = engine
            .create_network(&NetworkSpec {
                name: "backend".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        session.track_network(&net);
        let spec = ContainerSpec {
            image: "app".to_string(),
            networks: BTreeMap::from([("backend".to_string(), Vec::new())]),
            ..Default::default()
        };
        let a = engine.create_container(&spec).await.unwrap();
        session.track_container(&a);
        let b = engine.create_container(&spec).await.unwrap();
        session.track_container(&b);

        let failures = session.teardown(&engine, Duration::from_secs(1)).await;
        assert!(failures.is_empty());

        let removals: Vec<String> = engine
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("remove"))
            .collect();
        assert_eq!(
            removals,
            vec![
                format!("remove:{b}"),
                format!("remove:{a}"),
                format!("remove_network:{net}"),
            ]
        );
        assert!(session.tracked().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_tolerates_missing_resources() {
        let engine = FakeEngine::new();
        let session = Session::with_id("s");
        session.track_container("gone");
        session.track_network("also-gone");
        assert!(session.teardown(&engine, Duration::ZERO).await.is_empty());
    }
}
