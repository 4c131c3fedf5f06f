use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use async_trait::async_trait;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::AutoSaveActionKind;
use super::IoTaskGuard;
use super::PendingAction;
use super::RouterManagerSet;
use super::RouterObjectFlag;
use crate::proto::error::ErrorCode;
use crate::async_invoke;
use crate::await_tasks;
use crate::AwaitableContext;
use crate::RpcError;
use crate::RpcResult;
use crate::TaskAction;
use crate::TaskHandle;

/// Success and failure counters shared with the sub-tasks of a background job.
#[derive(Debug, Default)]
pub(crate) struct ActionStatus {
    pub(crate) success_count: AtomicI32,
    pub(crate) failed_count: AtomicI32,
}

impl ActionStatus {
    /// Counts the outcome of finished sub-tasks.
    pub(crate) fn collect(
        &self,
        tasks: &[TaskHandle],
    ) {
        for task in tasks {
            match task.result() {
                Some(Ok(())) => self.success_count.fetch_add(1, Ordering::Relaxed),
                _ => self.failed_count.fetch_add(1, Ordering::Relaxed),
            };
        }
    }

    pub(crate) fn fail(&self) {
        self.failed_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn success(&self) -> i32 {
        self.success_count.load(Ordering::Relaxed)
    }

    pub(crate) fn failed(&self) -> i32 {
        self.failed_count.load(Ordering::Relaxed)
    }
}

/// Drains the pending-action queue of a [`RouterManagerSet`].
pub struct TaskActionAutoSaveObjects {
    set: Weak<RouterManagerSet>,
    status: Arc<ActionStatus>,
    start_time: i64,
}

impl TaskActionAutoSaveObjects {
    pub fn new(set: Weak<RouterManagerSet>) -> Self {
        Self {
            set,
            status: Arc::new(ActionStatus::default()),
            start_time: 0,
        }
    }

    fn finish(
        &self,
        ctx: &AwaitableContext,
    ) {
        if let Some(set) = self.set.upgrade() {
            set.clear_auto_save_task(ctx.task_id());
        }
    }
}

#[async_trait]
impl TaskAction for TaskActionAutoSaveObjects {
    fn name(&self) -> &str {
        "router auto save"
    }

    async fn run(
        &mut self,
        ctx: &AwaitableContext,
    ) -> RpcResult<()> {
        let set = self
            .set
            .upgrade()
            .ok_or_else(|| RpcError::new(ErrorCode::RouterNotFound))?;
        self.start_time = ctx.sys_now();

        let router = ctx.settings().router.clone();
        let budget = match router.pending_action_max_count {
            0 => set.pending_action_count(),
            max => max,
        };
        let batch = router.pending_action_batch_count();

        let mut in_flight = Vec::with_capacity(batch);
        for _ in 0..budget {
            let Some(action) = set.pop_pending_action() else {
                break;
            };

            let name = format!("router {} {}", action.kind.name(), action.object.router_base().key());
            let actor = action.object.actor_executor();
            let job_set = set.clone();
            match async_invoke(ctx, name, actor, move |ctx| execute_pending_action(ctx, job_set, action)) {
                Ok(task) => in_flight.push(task),
                Err(e) => {
                    warn!(error = %e, "start router action failed");
                    self.status.fail();
                }
            }

            if in_flight.len() >= batch {
                await_tasks(ctx, &in_flight).await?;
                self.status.collect(&in_flight);
                in_flight.clear();
            }
        }

        if !in_flight.is_empty() {
            await_tasks(ctx, &in_flight).await?;
            self.status.collect(&in_flight);
        }
        Ok(())
    }

    async fn on_success(
        &mut self,
        ctx: &AwaitableContext,
    ) {
        let cost = ctx.sys_now() - self.start_time;
        debug!(
            success_count = self.status.success(),
            failed_count = self.status.failed(),
            cost,
            "router auto save finished"
        );
    }

    async fn on_failed(
        &mut self,
        _ctx: &AwaitableContext,
        error: &RpcError,
    ) {
        warn!(
            success_count = self.status.success(),
            failed_count = self.status.failed(),
            error = %error,
            "router auto save failed"
        );
    }

    async fn on_timeout(
        &mut self,
        _ctx: &AwaitableContext,
    ) {
        warn!(
            success_count = self.status.success(),
            failed_count = self.status.failed(),
            "router auto save timeout"
        );
    }

    async fn on_complete(
        &mut self,
        ctx: &AwaitableContext,
        _result: &RpcResult<()>,
    ) {
        self.finish(ctx);
    }
}

/// Runs one queued action. A cleared `Sched*` flag means the action is no longer wanted.
async fn execute_pending_action(
    ctx: AwaitableContext,
    set: Arc<RouterManagerSet>,
    action: PendingAction,
) -> RpcResult<()> {
    let PendingAction { kind, type_id, object } = action;
    let base = object.router_base();
    let key = base.key();

    match kind {
        AutoSaveActionKind::Save => {
            if !base.check_flag(RouterObjectFlag::SCHED_SAVE_OBJECT) {
                debug!(key = %key, "save already done");
                return Ok(());
            }
            let mut guard = IoTaskGuard::new();
            object.save_with_default_data(&ctx, &mut guard).await?;
            base.refresh_save_time(ctx.sys_now());
            Ok(())
        }
        AutoSaveActionKind::RemoveObject => {
            if !base.check_flag(RouterObjectFlag::SCHED_REMOVE_OBJECT) {
                debug!(key = %key, "remove object cancelled");
                return Ok(());
            }
            let manager = set
                .manager(type_id)
                .ok_or_else(|| RpcError::new(ErrorCode::RouterNotFound))?;
            let result = manager.remove_object_of(&ctx, object.clone()).await;
            if let Err(e) = &result {
                if base.check_flag(RouterObjectFlag::SCHED_REMOVE_OBJECT) {
                    info!(key = %key, error = %e, "remove object failed, retry next round");
                    base.set_flag(RouterObjectFlag::FORCE_REMOVE_OBJECT);
                }
            }
            base.unset_flag(RouterObjectFlag::SCHED_REMOVE_OBJECT);
            result
        }
        AutoSaveActionKind::RemoveCache => {
            if !base.check_flag(RouterObjectFlag::SCHED_REMOVE_CACHE) {
                debug!(key = %key, "remove cache cancelled");
                return Ok(());
            }
            let manager = set
                .manager(type_id)
                .ok_or_else(|| RpcError::new(ErrorCode::RouterNotFound))?;
            manager.remove_cache_of(&ctx, object.clone()).await
        }
    }
}
