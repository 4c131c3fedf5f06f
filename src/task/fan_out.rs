//! Sub-task fan-out and task-to-task waiting.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use super::run_task_action;
use super::ActorExecutor;
use super::AwaitDescriptor;
use super::AwaitableContext;
use super::FnTaskAction;
use super::ResumeData;
use super::TaskHandle;
use super::TaskOptions;
use super::WaitType;
use crate::proto::error::ErrorCode;
use crate::AppRuntime;
use crate::RpcError;
use crate::RpcResult;

/// Suspends the current task until `other` has finished. The result of `other` is not inspected.
/// Awaiting the current task itself returns at once.
pub async fn await_task(
    ctx: &AwaitableContext,
    other: &TaskHandle,
) -> RpcResult<()> {
    let current = ctx.require_task()?;
    // Waiting on itself would never wake up
    if other.is_finished() || current == other {
        return Ok(());
    }

    let descriptor = AwaitDescriptor::new(WaitType::Normal, other.id());
    let waiter = current.clone();
    let data = current
        .yield_with(
            descriptor,
            || {
                other.init_on_finish(move |_| {
                    // The waiter may have been killed or moved on
                    let _ = waiter.resume(descriptor, ResumeData::ok(descriptor));
                });
                Ok(())
            },
            None,
        )
        .await?;
    data.result
}

/// Waits for each task in order. Fails fast when the current task is exiting.
pub async fn await_tasks(
    ctx: &AwaitableContext,
    tasks: &[TaskHandle],
) -> RpcResult<()> {
    let current = ctx.require_task()?;
    for task in tasks {
        if current.is_timeout() {
            return Err(RpcError::new(ErrorCode::Timeout));
        }
        if current.is_fault() {
            return Err(RpcError::new(ErrorCode::RpcExiting));
        }
        await_task(ctx, task).await?;
    }
    Ok(())
}

/// Spawns a child task running `body`. It inherits the cancellation scope of `ctx` and uses the
/// background task timeout.
pub fn async_invoke<F, Fut>(
    ctx: &AwaitableContext,
    name: impl Into<String>,
    actor: Option<ActorExecutor>,
    body: F,
) -> RpcResult<TaskHandle>
where
    F: FnOnce(AwaitableContext) -> Fut + Send + 'static,
    Fut: Future<Output = RpcResult<()>> + Send + 'static,
{
    let app = ctx.app().clone();
    let name = name.into();
    let options = TaskOptions::with_timeout(app.settings().task.nomsg_timeout())
        .name(name.clone())
        .actor(actor)
        .parent(ctx.cancel_token());
    let task = app
        .task_manager()
        .create_task(FnTaskAction::new(name, body), options);
    run_task_action(&app, &task)?;
    Ok(task)
}

/// Creates a task running `body` once `after` finishes, immediately if it already has.
pub fn async_then<F, Fut>(
    ctx: &AwaitableContext,
    name: impl Into<String>,
    after: &TaskHandle,
    body: F,
) -> RpcResult<TaskHandle>
where
    F: FnOnce(AwaitableContext) -> Fut + Send + 'static,
    Fut: Future<Output = RpcResult<()>> + Send + 'static,
{
    let app = ctx.app().clone();
    let name = name.into();
    let options = TaskOptions::with_timeout(app.settings().task.nomsg_timeout())
        .name(name.clone())
        .parent(ctx.cancel_token());
    let task = app
        .task_manager()
        .create_task(FnTaskAction::new(name, body), options);
    async_then_start_task(&app, after, task.clone());
    Ok(task)
}

/// Starts an already created `task` once `after` finishes.
pub fn async_then_start_task(
    app: &Arc<AppRuntime>,
    after: &TaskHandle,
    task: TaskHandle,
) {
    let app = app.clone();
    after.init_on_finish(move |_| {
        if let Err(e) = run_task_action(&app, &task) {
            error!(task_id = task.id(), error = %e, "start chained task failed");
        }
    });
}

/// Sleeps inside a task. Running out the full duration is a success; a kill ends it early.
pub async fn wait(
    ctx: &AwaitableContext,
    duration: Duration,
) -> RpcResult<()> {
    let task = ctx.require_task()?;
    let descriptor = AwaitDescriptor::new(WaitType::Normal, task.id());
    match task.yield_with(descriptor, || Ok(()), Some(duration)).await {
        Ok(data) => data.result,
        Err(e) if e.is(ErrorCode::Timeout) && !task.is_fault() => Ok(()),
        Err(e) => Err(e),
    }
}
