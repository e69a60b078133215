//! Bounded parallel creation.

use futures::StreamExt;
use futures::stream;
use thiserror::Error;

use crate::lifecycle::Provider;
use crate::lifecycle::error::LifecycleError;
use crate::lifecycle::handle::ResourceHandle;
use crate::lifecycle::request::ResourceRequest;
use crate::wait::WaitContext;

/// Worker count used when the caller passes zero.
pub const DEFAULT_WORKERS: usize = 8;

/// Some requests of a parallel run failed.
#[derive(Debug, Error)]
#[error(
    "{failed} of {total} requests failed: {details}",
    failed = .failures.len(),
    total = .started.len() + .failures.len(),
    details = summary(.failures)
)]
pub struct ParallelError {
    /// Resources that did start, in request order. They are not terminated.
    pub started: Vec<ResourceHandle>,
    /// Index of each failed request and its error. A failed request's error
    /// may still carry a handle.
    pub failures: Vec<(usize, LifecycleError)>,
}

fn summary(failures: &[(usize, LifecycleError)]) -> String {
    failures
        .iter()
        .map(|(i, e)| format!("#{i}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Provider {
    /// Create and start every request with at most `workers` in flight.
    pub async fn run_parallel(
        &self,
        ctx: &WaitContext,
        requests: Vec<ResourceRequest>,
        workers: usize,
    ) -> Result<Vec<ResourceHandle>, ParallelError> {
        let workers = if workers == 0 { DEFAULT_WORKERS } else { workers };
        let total = requests.len();

        let mut results: Vec<(usize, Result<ResourceHandle, LifecycleError>)> =
            stream::iter(requests.into_iter().enumerate())
                .map(|(i, request)| async move { (i, self.run(ctx, request).await) })
                .buffer_unordered(workers)
                .collect()
                .await;
        results.sort_by_key(|(i, _)| *i);

        let mut started = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for (i, result) in results {
            match result {
                Ok(handle) => started.push(handle),
                Err(e) => failures.push((i, e)),
            }
        }

        if failures.is_empty() {
            Ok(started)
        } else {
            tracing::warn!(failed = failures.len(), total, "Parallel creation had failures");
            Err(ParallelError { started, failures })
        }
    }
}
