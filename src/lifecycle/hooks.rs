//! Ordered lifecycle hooks.
//!
//! Hooks are collected with an append-only [`LifecycleHooksBuilder`] and
//! frozen into an immutable [`LifecycleHooks`] before any call runs them.
//! Within a phase hooks run in registration order; the first failure stops
//! the phase.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::lifecycle::error::{LifecycleError, Phase};
use crate::lifecycle::handle::ResourceHandle;
use crate::lifecycle::request::ResourceRequest;
use crate::wait::WaitContext;

/// Runs before anything is created and may rewrite the request.
#[async_trait]
pub trait PreCreateHook: Send + Sync {
    async fn call(&self, ctx: &WaitContext, request: &mut ResourceRequest) -> anyhow::Result<()>;
}

/// Runs against an existing resource.
#[async_trait]
pub trait ResourceHook: Send + Sync {
    async fn call(&self, ctx: &WaitContext, handle: &ResourceHandle) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> PreCreateHook for F
where
    F: for<'a> Fn(&'a WaitContext, &'a mut ResourceRequest) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync,
{
    async fn call(&self, ctx: &WaitContext, request: &mut ResourceRequest) -> anyhow::Result<()> {
        (self)(ctx, request).await
    }
}

#[async_trait]
impl<F> ResourceHook for F
where
    F: for<'a> Fn(&'a WaitContext, &'a ResourceHandle) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync,
{
    async fn call(&self, ctx: &WaitContext, handle: &ResourceHandle) -> anyhow::Result<()> {
        (self)(ctx, handle).await
    }
}

/// Pins a closure to the [`PreCreateHook`] signature so its argument types
/// are inferred.
pub fn pre_create_hook<F>(f: F) -> F
where
    F: for<'a> Fn(&'a WaitContext, &'a mut ResourceRequest) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync,
{
    f
}

/// Pins a closure to the [`ResourceHook`] signature.
pub fn resource_hook<F>(f: F) -> F
where
    F: for<'a> Fn(&'a WaitContext, &'a ResourceHandle) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync,
{
    f
}

/// A frozen set of hooks for every phase.
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    pre_create: Arc<[Arc<dyn PreCreateHook>]>,
    post_create: Arc<[Arc<dyn ResourceHook>]>,
    pre_start: Arc<[Arc<dyn ResourceHook>]>,
    post_start: Arc<[Arc<dyn ResourceHook>]>,
    pre_terminate: Arc<[Arc<dyn ResourceHook>]>,
    post_terminate: Arc<[Arc<dyn ResourceHook>]>,
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("pre_create", &self.pre_create.len())
            .field("post_create", &self.post_create.len())
            .field("pre_start", &self.pre_start.len())
            .field("post_start", &self.post_start.len())
            .field("pre_terminate", &self.pre_terminate.len())
            .field("post_terminate", &self.post_terminate.len())
            .finish()
    }
}

impl LifecycleHooks {
    pub fn builder() -> LifecycleHooksBuilder {
        LifecycleHooksBuilder::default()
    }

    /// Merge provider defaults with caller hooks: in `pre-*` phases the
    /// defaults run first, in `post-*` phases they run last.
    pub fn around(defaults: &LifecycleHooks, user: &[LifecycleHooks]) -> LifecycleHooks {
        fn join<T: ?Sized>(groups: impl IntoIterator<Item = Arc<[Arc<T>]>>) -> Arc<[Arc<T>]> {
            groups
                .into_iter()
                .flat_map(|hooks| hooks.iter().cloned().collect::<Vec<_>>())
                .collect()
        }

        let pre = |pick: fn(&LifecycleHooks) -> &Arc<[Arc<dyn ResourceHook>]>| {
            join(std::iter::once(pick(defaults).clone()).chain(user.iter().map(|h| pick(h).clone())))
        };
        let post = |pick: fn(&LifecycleHooks) -> &Arc<[Arc<dyn ResourceHook>]>| {
            join(user.iter().map(|h| pick(h).clone()).chain(std::iter::once(pick(defaults).clone())))
        };

        LifecycleHooks {
            pre_create: join(
                std::iter::once(defaults.pre_create.clone())
                    .chain(user.iter().map(|h| h.pre_create.clone())),
            ),
            post_create: post(|h| &h.post_create),
            pre_start: pre(|h| &h.pre_start),
            post_start: post(|h| &h.post_start),
            pre_terminate: pre(|h| &h.pre_terminate),
            post_terminate: post(|h| &h.post_terminate),
        }
    }

    pub(crate) async fn run_pre_create(
        &self,
        ctx: &WaitContext,
        request: &mut ResourceRequest,
    ) -> Result<(), LifecycleError> {
        for (index, hook) in self.pre_create.iter().enumerate() {
            hook.call(ctx, request)
                .await
                .map_err(|source| LifecycleError::Hook {
                    phase: Phase::PreCreate,
                    index,
                    source,
                    handle: None,
                })?;
        }
        Ok(())
    }

    /// Run one resource phase. The returned error carries no handle; callers
    /// that own the handle attach it.
    pub(crate) async fn run(
        &self,
        phase: Phase,
        ctx: &WaitContext,
        handle: &ResourceHandle,
    ) -> Result<(), LifecycleError> {
        let hooks = match phase {
            Phase::PreCreate => return Ok(()),
            Phase::PostCreate => &self.post_create,
            Phase::PreStart => &self.pre_start,
            Phase::PostStart => &self.post_start,
            Phase::PreTerminate => &self.pre_terminate,
            Phase::PostTerminate => &self.post_terminate,
        };
        for (index, hook) in hooks.iter().enumerate() {
            if let Err(source) = hook.call(ctx, handle).await {
                tracing::debug!(
                    container_id = %handle.id(),
                    phase = %phase,
                    index,
                    error = %source,
                    "Lifecycle hook failed"
                );
                return Err(LifecycleError::Hook {
                    phase,
                    index,
                    source,
                    handle: None,
                });
            }
        }
        Ok(())
    }

    pub fn len(&self, phase: Phase) -> usize {
        match phase {
            Phase::PreCreate => self.pre_create.len(),
            Phase::PostCreate => self.post_create.len(),
            Phase::PreStart => self.pre_start.len(),
            Phase::PostStart => self.post_start.len(),
            Phase::PreTerminate => self.pre_terminate.len(),
            Phase::PostTerminate => self.post_terminate.len(),
        }
    }
}

/// Append-only collector for [`LifecycleHooks`].
#[derive(Default)]
pub struct LifecycleHooksBuilder {
    pre_create: Vec<Arc<dyn PreCreateHook>>,
    post_create: Vec<Arc<dyn ResourceHook>>,
    pre_start: Vec<Arc<dyn ResourceHook>>,
    post_start: Vec<Arc<dyn ResourceHook>>,
    pre_terminate: Vec<Arc<dyn ResourceHook>>,
    post_terminate: Vec<Arc<dyn ResourceHook>>,
}

impl LifecycleHooksBuilder {
    pub fn pre_create(mut self, hook: impl PreCreateHook + 'static) -> Self {
        self.pre_create.push(Arc::new(hook));
        self
    }

    pub fn post_create(mut self, hook: impl ResourceHook + 'static) -> Self {
        self.post_create.push(Arc::new(hook));
        self
    }

    pub fn pre_start(mut self, hook: impl ResourceHook + 'static) -> Self {
        self.pre_start.push(Arc::new(hook));
        self
    }

    pub fn post_start(mut self, hook: impl ResourceHook + 'static) -> Self {
        self.post_start.push(Arc::new(hook));
        self
    }

    pub fn pre_terminate(mut self, hook: impl ResourceHook + 'static) -> Self {
        self.pre_terminate.push(Arc::new(hook));
        self
    }

    pub fn post_terminate(mut self, hook: impl ResourceHook + 'static) -> Self {
        self.post_terminate.push(Arc::new(hook));
        self
    }

    pub fn build(self) -> LifecycleHooks {
        LifecycleHooks {
            pre_create: self.pre_create.into(),
            post_create: self.post_create.into(),
            pre_start: self.pre_start.into(),
            post_start: self.post_start.into(),
            pre_terminate: self.pre_terminate.into(),
            post_terminate: self.post_terminate.into(),
        }
    }
}
