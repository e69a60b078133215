//! Guaranteed-release helpers around termination.

use crate::lifecycle::error::{LifecycleError, Result};
use crate::lifecycle::handle::ResourceHandle;

/// Terminate `handle` if there is one. A resource that is already gone, or
/// was never created, counts as cleaned up.
///
/// ```rust,no_run
/// # use throwaway::lifecycle::{cleanup_resource, LifecycleError, Provider, ResourceRequest};
/// # use throwaway::wait::WaitContext;
/// # async fn demo(provider: Provider) -> Result<(), LifecycleError> {
/// let result = provider.run(&WaitContext::default(), ResourceRequest::new("redis:7")).await;
/// let handle = match result {
///     Ok(handle) => handle,
///     Err(e) => {
///         cleanup_resource(e.handle()).await?;
///         return Err(e);
///     }
/// };
/// cleanup_resource(Some(&handle)).await
/// # }
/// ```
pub async fn cleanup_resource(handle: Option<&ResourceHandle>) -> Result<()> {
    let Some(handle) = handle else {
        return Ok(());
    };
    match handle.terminate().await {
        Ok(()) => Ok(()),
        Err(LifecycleError::Termination(e)) if e.source.is_not_found() => Ok(()),
        Err(e) => {
            tracing::warn!(container_id = %handle.id(), error = %e, "Cleanup failed");
            Err(e)
        }
    }
}

/// Owns a handle and terminates it when dropped.
///
/// The drop path spawns the termination on the current tokio runtime and does
/// not wait for it; prefer [`terminate`](Self::terminate) where an async
/// context is available. Outside a runtime nothing is spawned and removal is
/// left to the reaper.
#[derive(Debug)]
pub struct ResourceGuard {
    handle: Option<ResourceHandle>,
}

impl ResourceGuard {
    pub fn new(handle: ResourceHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> Option<&ResourceHandle> {
        self.handle.as_ref()
    }

    /// Give the handle back without terminating it.
    pub fn disarm(mut self) -> Option<ResourceHandle> {
        self.handle.take()
    }

    /// Terminate now and wait for the outcome.
    pub async fn terminate(mut self) -> Result<()> {
        let handle = self.handle.take();
        cleanup_resource(handle.as_ref()).await
    }
}

impl From<ResourceHandle> for ResourceGuard {
    fn from(handle: ResourceHandle) -> Self {
        Self::new(handle)
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.is_terminated() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let _ = cleanup_resource(Some(&handle)).await;
                });
            }
            Err(_) => tracing::warn!(
                container_id = %handle.id(),
                "No async runtime while dropping resource guard; leaving removal to the reaper"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::Config;
    use crate::lifecycle::{Provider, ResourceRequest};
    use crate::session::Session;
    use crate::testing::FakeEngine;
    use crate::wait::WaitContext;

    async fn started(engine: &Arc<FakeEngine>) -> ResourceHandle {
        let mut config = Config::default();
        config.reaper.disabled = true;
        let provider = Provider::with_session(engine.clone(), config, Arc::new(Session::new()));
        provider
            .run(&WaitContext::default(), ResourceRequest::new("app"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_cleanup_without_handle_is_ok() {
        cleanup_resource(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_guard_terminates_on_drop() {
        let engine = Arc::new(FakeEngine::new());
        let guard = ResourceGuard::new(started(&engine).await);
        assert_eq!(engine.container_ids().len(), 1);

        drop(guard);
        for _ in 0..50 {
            if engine.container_ids().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(engine.container_ids().is_empty());
    }

    #[tokio::test]
    async fn test_disarmed_guard_leaves_resource() {
        let engine = Arc::new(FakeEngine::new());
        let guard = ResourceGuard::new(started(&engine).await);
        let handle = guard.disarm().unwrap();
        tokio::task::yield_now().await;
        assert_eq!(engine.container_ids(), vec![handle.id().to_string()]);
    }

    #[tokio::test]
    async fn test_explicit_terminate() {
        let engine = Arc::new(FakeEngine::new());
        let guard: ResourceGuard = started(&engine).await.into();
        guard.terminate().await.unwrap();
        assert!(engine.container_ids().is_empty());
    }
}
