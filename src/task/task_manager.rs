use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info_span;
use tracing::warn;
use tracing::Instrument;

use super::ActorExecutor;
use super::AwaitableContext;
use super::TaskAction;
use super::TaskHandle;
use crate::constants::TASK_ID_EPOCH_SECS;
use crate::proto::error::ErrorCode;
use crate::utils::time::get_nanos_since;
use crate::AppRuntime;
use crate::Result;
use crate::RpcError;
use crate::TaskError;

/// Creation parameters of a task.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Display name, defaults to the action name
    pub name: Option<String>,
    /// `None` runs without a timer
    pub timeout: Option<Duration>,
    pub actor: Option<ActorExecutor>,
    /// Cancellation scope of the parent; the task gets a child token
    pub parent: Option<CancellationToken>,
}

impl TaskOptions {
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    pub fn name(
        mut self,
        name: impl Into<String>,
    ) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn actor(
        mut self,
        actor: Option<ActorExecutor>,
    ) -> Self {
        self.actor = actor;
        self
    }

    pub fn parent(
        mut self,
        parent: &CancellationToken,
    ) -> Self {
        self.parent = Some(parent.clone());
        self
    }
}

/// Allocates task ids and tracks running tasks.
pub struct TaskManager {
    next_task_id: AtomicU64,
    tasks: DashMap<u64, TaskHandle>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    /// Ids are seeded from the wall clock so a restarted process never reuses the id of a task
    /// that may still receive late resumes.
    pub fn new() -> Self {
        Self::with_seed(get_nanos_since(TASK_ID_EPOCH_SECS))
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            next_task_id: AtomicU64::new(seed.max(1)),
            tasks: DashMap::new(),
        }
    }

    pub fn create_task(
        &self,
        action: impl TaskAction,
        options: TaskOptions,
    ) -> TaskHandle {
        self.create_boxed_task(Box::new(action), options)
    }

    pub fn create_boxed_task(
        &self,
        action: Box<dyn TaskAction>,
        options: TaskOptions,
    ) -> TaskHandle {
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let name = options.name.unwrap_or_else(|| action.name().to_string());
        let cancel = match options.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        TaskHandle::new(id, name, options.timeout, options.actor, cancel, action)
    }

    pub fn get_task(
        &self,
        task_id: u64,
    ) -> Option<TaskHandle> {
        self.tasks.get(&task_id).map(|entry| entry.value().clone())
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Kills every running task. Used when the process cannot wait any longer.
    pub fn kill_all(&self) -> usize {
        let tasks: Vec<TaskHandle> = self.tasks.iter().map(|entry| entry.value().clone()).collect();
        tasks.iter().filter(|task| task.kill()).count()
    }

    fn insert(
        &self,
        task: TaskHandle,
    ) {
        self.tasks.insert(task.id(), task);
    }

    fn remove(
        &self,
        task_id: u64,
    ) {
        self.tasks.remove(&task_id);
    }
}

/// Starts a created task: registers it, arms its timer and spawns its body.
pub fn run_task_action(
    app: &Arc<AppRuntime>,
    task: &TaskHandle,
) -> Result<()> {
    let action = task
        .take_action()
        .ok_or(TaskError::NothingToRun(task.id()))?;

    app.task_manager().insert(task.clone());
    task.arm_timeout();

    let span = info_span!("task", task_id = task.id(), task_name = %task.name());
    tokio::spawn(execute(app.clone(), task.clone(), action).instrument(span));
    Ok(())
}

async fn execute(
    app: Arc<AppRuntime>,
    task: TaskHandle,
    mut action: Box<dyn TaskAction>,
) {
    let ctx = AwaitableContext::for_task(app.clone(), task.clone());
    task.set_running();
    if let Some(actor) = task.actor() {
        task.hold_actor_permit(actor.acquire().await);
    }

    let run_result = match task.fault_code() {
        Some(code) => Err(RpcError::new(code)),
        None => action.run(&ctx).await,
    };
    // A kill observed after the body returned still decides the outcome
    let result = match (task.fault_code(), run_result) {
        (Some(code), Err(e)) if e.is(code) => Err(e),
        (Some(code), _) => Err(RpcError::new(code)),
        (None, result) => result,
    };

    match &result {
        Ok(()) => action.on_success(&ctx).await,
        Err(e) if e.is(ErrorCode::Timeout) => action.on_timeout(&ctx).await,
        Err(e) => action.on_failed(&ctx, e).await,
    }
    action.on_complete(&ctx, &result).await;
    task.release_actor_permit();

    match &result {
        Ok(()) => debug!("task finished"),
        Err(e) => warn!(error = %e, "task finished with error"),
    }
    task.finish(result);
    app.task_manager().remove(task.id());
}
