use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::TaskHandle;
use crate::proto::error::ErrorCode;
use crate::AppRuntime;
use crate::RpcError;
use crate::RpcResult;
use crate::Settings;
use crate::TaskError;

/// Everything an operation needs to suspend and resume: the app, the running task and the
/// cancellation scope.
#[derive(Clone)]
pub struct AwaitableContext {
    app: Arc<AppRuntime>,
    task: Option<TaskHandle>,
    cancel: CancellationToken,
}

impl AwaitableContext {
    /// Context outside any task. Operations that need to suspend fail with `RpcNoTask`.
    pub fn new(app: Arc<AppRuntime>) -> Self {
        Self {
            app,
            task: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn for_task(
        app: Arc<AppRuntime>,
        task: TaskHandle,
    ) -> Self {
        let cancel = task.cancel_token().clone();
        Self {
            app,
            task: Some(task),
            cancel,
        }
    }

    pub fn app(&self) -> &Arc<AppRuntime> {
        &self.app
    }

    pub fn task(&self) -> Option<&TaskHandle> {
        self.task.as_ref()
    }

    pub fn task_id(&self) -> u64 {
        self.task.as_ref().map(TaskHandle::id).unwrap_or(0)
    }

    pub fn require_task(&self) -> RpcResult<&TaskHandle> {
        self.task
            .as_ref()
            .ok_or_else(|| RpcError::with_source(ErrorCode::RpcNoTask, TaskError::NoTask))
    }

    /// Cancelled when the owning task is killed or times out.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn sys_now(&self) -> i64 {
        self.app.sys_now()
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.app.settings()
    }
}

impl fmt::Debug for AwaitableContext {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("AwaitableContext")
            .field("task", &self.task)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
