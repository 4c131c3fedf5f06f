use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::same_object;
use super::ActionStatus;
use super::ManagedObject;
use super::RouterManagerSet;
use crate::async_invoke;
use crate::await_tasks;
use crate::run_task_action;
use crate::AwaitableContext;
use crate::FnTaskAction;
use crate::RpcError;
use crate::RpcResult;
use crate::TaskAction;
use crate::TaskOptions;

type ObjectQueue = Arc<Mutex<VecDeque<Arc<dyn ManagedObject>>>>;

/// Saves and downgrades every writable object collected by [`RouterManagerSet::stop`].
///
/// When the task is killed or times out, a detached fallback task walks the objects that were
/// not confirmed yet and removes them one by one, ignoring errors.
pub struct TaskActionRouterCloseManagerSet {
    set: Weak<RouterManagerSet>,
    pending: ObjectQueue,
    in_flight: ObjectQueue,
    status: Arc<ActionStatus>,
}

impl TaskActionRouterCloseManagerSet {
    pub fn new(
        set: Weak<RouterManagerSet>,
        pending: VecDeque<Arc<dyn ManagedObject>>,
    ) -> Self {
        Self {
            set,
            pending: Arc::new(Mutex::new(pending)),
            in_flight: Arc::new(Mutex::new(VecDeque::new())),
            status: Arc::new(ActionStatus::default()),
        }
    }

    /// Hands the unconfirmed objects over to a root task, out of the cancelled scope.
    fn start_fallback(
        &self,
        ctx: &AwaitableContext,
    ) {
        let Some(set) = self.set.upgrade() else {
            return;
        };
        let mut remaining: Vec<Arc<dyn ManagedObject>> = self.in_flight.lock().drain(..).collect();
        remaining.extend(self.pending.lock().drain(..));
        remaining.retain(|object| object.router_base().is_writable());
        if remaining.is_empty() {
            return;
        }
        warn!(objects = remaining.len(), "router closing interrupted, saving the rest");

        let app = ctx.app().clone();
        let options =
            TaskOptions::with_timeout(app.settings().task.nomsg_timeout()).name("router close manager set fallback");
        let body_set = set.clone();
        let body = move |ctx: AwaitableContext| async move {
            for object in remaining {
                remove_managed_object(&ctx, &body_set, object)
                    .await
                    .unwrap_or_else(|e| warn!(error = %e, "fallback remove object failed"));
            }
            Ok::<(), RpcError>(())
        };
        let task = app
            .task_manager()
            .create_task(FnTaskAction::new("router close manager set fallback", body), options);
        match run_task_action(&app, &task) {
            Ok(()) => set.set_closing_fallback_task(task),
            Err(e) => error!(error = %e, "start closing fallback failed"),
        }
    }

    fn finish(
        &self,
        ctx: &AwaitableContext,
    ) {
        if let Some(set) = self.set.upgrade() {
            set.clear_closing_task(ctx.task_id());
        }
    }
}

#[async_trait]
impl TaskAction for TaskActionRouterCloseManagerSet {
    fn name(&self) -> &str {
        "router close manager set"
    }

    async fn run(
        &mut self,
        ctx: &AwaitableContext,
    ) -> RpcResult<()> {
        let Some(set) = self.set.upgrade() else {
            return Ok(());
        };
        let batch = ctx.settings().router.closing_action_batch_count();

        let mut tasks = Vec::with_capacity(batch);
        loop {
            let next = self.pending.lock().pop_front();
            let Some(object) = next else {
                break;
            };
            if !object.router_base().is_writable() {
                continue;
            }

            let name = format!("router close {}", object.router_base().key());
            let actor = object.actor_executor();
            let job_set = set.clone();
            let job_object = object.clone();
            self.in_flight.lock().push_back(object);
            match async_invoke(ctx, name, actor, move |ctx| async move {
                remove_managed_object(&ctx, &job_set, job_object).await
            }) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    warn!(error = %e, "start router close action failed");
                    self.status.fail();
                }
            }

            if tasks.len() >= batch {
                await_tasks(ctx, &tasks).await?;
                self.status.collect(&tasks);
                tasks.clear();
                self.in_flight.lock().clear();
            }
        }

        if !tasks.is_empty() {
            await_tasks(ctx, &tasks).await?;
            self.status.collect(&tasks);
            self.in_flight.lock().clear();
        }
        Ok(())
    }

    async fn on_success(
        &mut self,
        _ctx: &AwaitableContext,
    ) {
        info!(
            success_count = self.status.success(),
            failed_count = self.status.failed(),
            "router manager set close finished"
        );
    }

    async fn on_failed(
        &mut self,
        ctx: &AwaitableContext,
        error: &RpcError,
    ) {
        warn!(
            success_count = self.status.success(),
            failed_count = self.status.failed(),
            error = %error,
            "router manager set close failed"
        );
        self.start_fallback(ctx);
    }

    async fn on_timeout(
        &mut self,
        ctx: &AwaitableContext,
    ) {
        warn!(
            success_count = self.status.success(),
            failed_count = self.status.failed(),
            "router manager set close timeout"
        );
        self.start_fallback(ctx);
    }

    async fn on_complete(
        &mut self,
        ctx: &AwaitableContext,
        _result: &RpcResult<()>,
    ) {
        self.finish(ctx);
    }
}

/// Saves and downgrades `object` if its manager still holds it.
async fn remove_managed_object(
    ctx: &AwaitableContext,
    set: &RouterManagerSet,
    object: Arc<dyn ManagedObject>,
) -> RpcResult<()> {
    let base = object.router_base();
    if !base.is_writable() {
        return Ok(());
    }
    let Some(manager) = set.manager(base.key().type_id) else {
        return Ok(());
    };
    if !manager
        .base_cache(&base.key())
        .is_some_and(|current| same_object(&current, &object))
    {
        return Ok(());
    }
    manager.remove_object_of(ctx, object.clone()).await
}
