use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use tracing::error;

use super::RouterObjectBase;
use crate::AwaitDescriptor;
use crate::AwaitableContext;
use crate::ResumeData;
use crate::RpcResult;
use crate::TaskHandle;
use crate::WaitType;

#[derive(Default)]
struct IoState {
    holder: Option<TaskHandle>,
    waiters: VecDeque<TaskHandle>,
}

impl IoState {
    /// Forgets a holder that already exited.
    fn holder_id(&mut self) -> u64 {
        if self.holder.as_ref().is_some_and(TaskHandle::is_exiting) {
            self.holder = None;
        }
        self.holder.as_ref().map(TaskHandle::id).unwrap_or(0)
    }
}

/// Single-writer IO slot of one router object.
pub(crate) struct IoSlot {
    handle_id: u64,
    state: Mutex<IoState>,
}

impl IoSlot {
    pub(crate) fn new(handle_id: u64) -> Self {
        Self {
            handle_id,
            state: Mutex::new(IoState::default()),
        }
    }

    pub(crate) fn holder_id(&self) -> u64 {
        self.state.lock().holder_id()
    }

    pub(crate) fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    fn descriptor(
        &self,
        task_id: u64,
    ) -> AwaitDescriptor {
        AwaitDescriptor::new(WaitType::Io(self.handle_id), task_id)
    }

    fn try_claim(
        &self,
        task: &TaskHandle,
    ) -> bool {
        let mut state = self.state.lock();
        let holder = state.holder_id();
        if holder == 0 || holder == task.id() {
            state.holder = Some(task.clone());
            return true;
        }
        false
    }

    /// Suspends `task` until the slot is free, then claims it.
    async fn acquire(
        &self,
        ctx: &AwaitableContext,
        task: &TaskHandle,
    ) -> RpcResult<()> {
        let descriptor = self.descriptor(task.id());
        let timeout = ctx.settings().task.csmsg_timeout();
        loop {
            if self.try_claim(task) {
                return Ok(());
            }

            let waiter = task.clone();
            let result = task
                .yield_with(
                    descriptor,
                    || {
                        let mut state = self.state.lock();
                        if state.holder_id() == 0 {
                            drop(state);
                            let _ = waiter.resume(descriptor, ResumeData::ok(descriptor));
                        } else {
                            state.waiters.push_back(waiter);
                        }
                        Ok(())
                    },
                    timeout,
                )
                .await;
            self.state.lock().waiters.retain(|t| t.id() != task.id());

            if let Err(e) = result {
                if task.is_fault() {
                    return Err(e);
                }
            }
        }
    }

    /// Frees the slot if `task_id` still holds it and wakes every live waiter.
    fn release(
        &self,
        task_id: u64,
    ) {
        let waiters: Vec<TaskHandle> = {
            let mut state = self.state.lock();
            if state.holder_id() != task_id {
                return;
            }
            state.holder = None;
            state.waiters.retain(|t| !t.is_exiting());
            state.waiters.iter().cloned().collect()
        };

        for waiter in waiters {
            let descriptor = self.descriptor(waiter.id());
            if let Err(e) = waiter.resume(descriptor, ResumeData::ok(descriptor)) {
                error!(task_id = waiter.id(), error = %e, "resume io waiter failed");
                self.state.lock().waiters.retain(|t| t.id() != waiter.id());
            }
        }
    }
}

/// Scoped ownership of a router object's IO slot.
///
/// Taking the guard suspends the task while another task performs IO on the object. Taking it
/// again from the task that already holds the slot is a no-op. Dropping the guard frees the slot
/// and wakes the waiting tasks.
#[derive(Default)]
pub struct IoTaskGuard {
    owner: Option<(Arc<IoSlot>, u64)>,
}

impl IoTaskGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn take(
        &mut self,
        ctx: &AwaitableContext,
        base: &RouterObjectBase,
    ) -> RpcResult<()> {
        let task = ctx.require_task()?;
        let slot = base.io_slot();
        if slot.holder_id() == task.id() {
            return Ok(());
        }

        slot.acquire(ctx, task).await?;
        debug!(task_id = task.id(), key = %base.key(), "io slot taken");

        if self.owner.as_ref().is_some_and(|(owner, _)| !Arc::ptr_eq(owner, slot)) {
            self.resume_await_task();
        }
        self.owner = Some((slot.clone(), task.id()));
        Ok(())
    }

    /// Whether this guard currently owns a slot.
    pub fn is_taken(&self) -> bool {
        self.owner.is_some()
    }

    /// Frees the owned slot. Does nothing when another task took over in between.
    pub fn resume_await_task(&mut self) {
        if let Some((slot, task_id)) = self.owner.take() {
            slot.release(task_id);
        }
    }
}

impl Drop for IoTaskGuard {
    fn drop(&mut self) {
        self.resume_await_task();
    }
}

impl fmt::Debug for IoTaskGuard {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("IoTaskGuard")
            .field("task_id", &self.owner.as_ref().map(|(_, id)| *id))
            .finish()
    }
}
