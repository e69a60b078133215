//! Hooks every provider installs around caller hooks.
//!
//! ```text
//!   pre-create     session labels → reaper registration → (caller hooks)
//!   post-create    (caller hooks) → copy files
//!   post-start     (caller hooks) → follow logs → readiness wait
//!   pre-terminate  stop log followers → (caller hooks)
//! ```

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use crate::lifecycle::handle::ResourceHandle;
use crate::lifecycle::hooks::{LifecycleHooks, PreCreateHook, ResourceHook};
use crate::lifecycle::request::ResourceRequest;
use crate::reaper::client::ReaperClient;
use crate::session::{LABEL_REAP, LABEL_SESSION_ID, Session};
use crate::wait::{WaitContext, wait_until_ready};

pub(crate) fn default_hooks(
    session: Arc<Session>,
    reaper: Option<Arc<ReaperClient>>,
    reaper_required: bool,
) -> LifecycleHooks {
    LifecycleHooks::builder()
        .pre_create(StampSessionLabels { session })
        .pre_create(RegisterWithReaper {
            reaper,
            required: reaper_required,
        })
        .post_create(CopyFiles)
        .post_start(FollowLogs)
        .post_start(AwaitReadiness)
        .pre_terminate(StopLogFollowers)
        .build()
}

struct StampSessionLabels {
    session: Arc<Session>,
}

#[async_trait]
impl PreCreateHook for StampSessionLabels {
    async fn call(&self, _ctx: &WaitContext, request: &mut ResourceRequest) -> anyhow::Result<()> {
        request
            .labels
            .insert(LABEL_SESSION_ID.to_string(), self.session.id().to_string());
        if request.skip_reaper {
            request.labels.remove(LABEL_REAP);
        } else {
            request
                .labels
                .insert(LABEL_REAP.to_string(), "true".to_string());
        }
        Ok(())
    }
}

struct RegisterWithReaper {
    reaper: Option<Arc<ReaperClient>>,
    required: bool,
}

#[async_trait]
impl PreCreateHook for RegisterWithReaper {
    async fn call(&self, _ctx: &WaitContext, request: &mut ResourceRequest) -> anyhow::Result<()> {
        let Some(reaper) = &self.reaper else {
            return Ok(());
        };
        if request.skip_reaper {
            return Ok(());
        }
        match reaper.ensure_registered().await {
            Ok(()) => Ok(()),
            Err(e) if self.required => Err(e.into()),
            Err(e) => {
                reaper.warn_degraded(&e);
                Ok(())
            }
        }
    }
}

struct CopyFiles;

#[async_trait]
impl ResourceHook for CopyFiles {
    async fn call(&self, _ctx: &WaitContext, handle: &ResourceHandle) -> anyhow::Result<()> {
        for file in &handle.request().files {
            handle
                .copy_file(file)
                .await
                .with_context(|| format!("copying {} into {}", file.path, handle.id()))?;
        }
        Ok(())
    }
}

struct FollowLogs;

#[async_trait]
impl ResourceHook for FollowLogs {
    async fn call(&self, _ctx: &WaitContext, handle: &ResourceHandle) -> anyhow::Result<()> {
        for consumer in &handle.request().log_consumers {
            handle.follow_logs(consumer.clone()).await;
        }
        Ok(())
    }
}

struct AwaitReadiness;

#[async_trait]
impl ResourceHook for AwaitReadiness {
    async fn call(&self, ctx: &WaitContext, handle: &ResourceHandle) -> anyhow::Result<()> {
        if let Some(spec) = &handle.request().wait {
            let defaults = handle.provider().config().wait;
            wait_until_ready(ctx, handle, spec, &defaults).await?;
        }
        Ok(())
    }
}

struct StopLogFollowers;

#[async_trait]
impl ResourceHook for StopLogFollowers {
    async fn call(&self, _ctx: &WaitContext, handle: &ResourceHandle) -> anyhow::Result<()> {
        handle.stop_log_followers().await;
        Ok(())
    }
}
