use std::future::Future;

use async_trait::async_trait;

use super::AwaitableContext;
use crate::RpcError;
use crate::RpcResult;

/// A cooperative unit of work: one inbound RPC or one background job.
///
/// Hooks run in this order after `run`: exactly one of `on_timeout`, `on_failed` or
/// `on_success`, then `on_complete`, then the finish callbacks of the task.
#[async_trait]
pub trait TaskAction: Send + 'static {
    fn name(&self) -> &str;

    async fn run(
        &mut self,
        ctx: &AwaitableContext,
    ) -> RpcResult<()>;

    async fn on_success(
        &mut self,
        _ctx: &AwaitableContext,
    ) {
    }

    async fn on_failed(
        &mut self,
        _ctx: &AwaitableContext,
        _error: &RpcError,
    ) {
    }

    async fn on_timeout(
        &mut self,
        _ctx: &AwaitableContext,
    ) {
    }

    async fn on_complete(
        &mut self,
        _ctx: &AwaitableContext,
        _result: &RpcResult<()>,
    ) {
    }
}

/// Task action backed by a one-shot async closure.
pub struct FnTaskAction<F> {
    name: String,
    body: Option<F>,
}

impl<F> FnTaskAction<F> {
    pub fn new(
        name: impl Into<String>,
        body: F,
    ) -> Self {
        Self {
            name: name.into(),
            body: Some(body),
        }
    }
}

#[async_trait]
impl<F, Fut> TaskAction for FnTaskAction<F>
where
    F: FnOnce(AwaitableContext) -> Fut + Send + 'static,
    Fut: Future<Output = RpcResult<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &mut self,
        ctx: &AwaitableContext,
    ) -> RpcResult<()> {
        match self.body.take() {
            Some(body) => body(ctx.clone()).await,
            None => Ok(()),
        }
    }
}
