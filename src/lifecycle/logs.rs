//! Log following.
//!
//! A [`LogFollower`] is a background worker that polls a container's log by
//! byte offset and hands each new frame to a [`LogConsumer`], which has one
//! sink per stream. It stops when cancelled, after draining whatever output is
//! already available, and its completion can be awaited.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::{Engine, LogStream};

/// Receives log output.
pub trait LogConsumer: Send + Sync {
    fn on_stdout(&self, data: &[u8]);

    fn on_stderr(&self, data: &[u8]);
}

/// Forwards every complete chunk to `tracing` at debug level.
#[derive(Debug, Clone)]
pub struct TracingConsumer {
    pub container: String,
}

impl LogConsumer for TracingConsumer {
    fn on_stdout(&self, data: &[u8]) {
        for line in String::from_utf8_lossy(data).lines() {
            tracing::debug!(container = %self.container, stream = "stdout", "{}", line);
        }
    }

    fn on_stderr(&self, data: &[u8]) {
        for line in String::from_utf8_lossy(data).lines() {
            tracing::debug!(container = %self.container, stream = "stderr", "{}", line);
        }
    }
}

/// Buffers output in memory.
#[derive(Debug, Default)]
pub struct CollectingConsumer {
    stdout: Mutex<Vec<u8>>,
    stderr: Mutex<Vec<u8>>,
}

impl CollectingConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout.lock().unwrap_or_else(|e| e.into_inner())).to_string()
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr.lock().unwrap_or_else(|e| e.into_inner())).to_string()
    }
}

impl LogConsumer for CollectingConsumer {
    fn on_stdout(&self, data: &[u8]) {
        self.stdout
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(data);
    }

    fn on_stderr(&self, data: &[u8]) {
        self.stderr
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(data);
    }
}

/// A running log-follow worker.
pub struct LogFollower {
    cancel: CancellationToken,
    task: Option<JoinHandle<u64>>,
}

impl LogFollower {
    /// Start following `id`, polling every `interval`.
    pub fn spawn(
        engine: Arc<dyn Engine>,
        id: String,
        consumer: Arc<dyn LogConsumer>,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut offset = 0u64;
            loop {
                offset = forward(engine.as_ref(), &id, consumer.as_ref(), offset).await;
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            // Drain what was written before the stop request.
            forward(engine.as_ref(), &id, consumer.as_ref(), offset).await
        });
        Self {
            cancel,
            task: Some(task),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop following and wait for the worker to drain. Returns the log
    /// offset reached.
    pub async fn stop(mut self) -> u64 {
        self.cancel.cancel();
        let Some(task) = self.task.take() else {
            return 0;
        };
        match task.await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Log follower task failed: {}", e);
                0
            }
        }
    }
}

impl Drop for LogFollower {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Deliver everything after `offset`; returns the new offset.
async fn forward(engine: &dyn Engine, id: &str, consumer: &dyn LogConsumer, offset: u64) -> u64 {
    match engine.logs(id, offset).await {
        Ok(chunk) => {
            for frame in &chunk.frames {
                match frame.stream {
                    LogStream::Stdout => consumer.on_stdout(&frame.data),
                    LogStream::Stderr => consumer.on_stderr(&frame.data),
                }
            }
            chunk.next_offset()
        }
        Err(e) => {
            tracing::trace!(container_id = %id, error = %e, "Log poll failed");
            offset
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;

    #[tokio::test(start_paused = true)]
    async fn test_follower_splits_streams_and_drains_on_stop() {
        let engine = Arc::new(FakeEngine::new());
        let id = engine.add_running("c1");
        engine.emit_log(&id, "hello\n");
        engine.emit_stderr(&id, "warning\n");

        let consumer = Arc::new(CollectingConsumer::new());
        let follower = LogFollower::spawn(
            engine.clone(),
            id.clone(),
            consumer.clone(),
            Duration::from_millis(100),
        );

        tokio::time::sleep(Duration::from_millis(250)).await;
        engine.emit_log(&id, "bye\n");
        let delivered = follower.stop().await;

        assert_eq!(consumer.stdout(), "hello\nbye\n");
        assert_eq!(consumer.stderr(), "warning\n");
        assert_eq!(delivered, 18);
    }
}
