use std::time::Duration;

use tracing::error;
use tracing::trace;

use crate::AwaitDescriptor;
use crate::AwaitableContext;
use crate::Result;
use crate::ResumeData;
use crate::RpcResult;
use crate::TaskHandle;
use crate::WaitType;

/// Wait reservation handed out by a dispatcher for one outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherAwaitOptions {
    pub wait_type: WaitType,
    /// Unique within the issuing dispatcher, used as the wait id
    pub sequence: u64,
    /// `None` leaves the deadline to the task timer
    pub timeout: Option<Duration>,
}

impl DispatcherAwaitOptions {
    pub fn descriptor(&self) -> AwaitDescriptor {
        AwaitDescriptor::new(self.wait_type, self.sequence)
    }
}

/// Suspends the current task on `options` after `pre_yield` scheduled the IO that resumes it.
///
/// A failing `pre_yield` is returned without suspending. An error carried by the resume payload
/// is returned as the result, so `Ok` always means the IO itself succeeded.
pub async fn yield_task_action<F>(
    ctx: &AwaitableContext,
    options: &DispatcherAwaitOptions,
    pre_yield: F,
) -> RpcResult<ResumeData>
where
    F: FnOnce() -> RpcResult<()> + Send,
{
    let task = ctx.require_task()?;
    let mut data = task
        .yield_with(options.descriptor(), pre_yield, options.timeout)
        .await?;
    std::mem::replace(&mut data.result, Ok(()))?;
    Ok(data)
}

/// Delivers `data` to `task`.
///
/// Tasks bound to an actor get the delivery through the actor queue so it is ordered with the
/// other callbacks of that owner. A descriptor mismatch is dropped; an unreachable task is an
/// error.
pub fn resume_task_action(
    task: &TaskHandle,
    data: ResumeData,
) -> Result<()> {
    let Some(actor) = task.actor() else {
        return deliver(task, data);
    };

    let target = task.clone();
    actor.post(move || {
        if let Err(e) = deliver(&target, data) {
            error!(task_id = target.id(), task_name = %target.name(), error = %e, "resume task action failed");
        }
    })
}

fn deliver(
    task: &TaskHandle,
    data: ResumeData,
) -> Result<()> {
    let descriptor = data.descriptor;
    if !task.resume(descriptor, data)? {
        trace!(task_id = task.id(), ?descriptor, "resume dropped, task moved on");
    }
    Ok(())
}
