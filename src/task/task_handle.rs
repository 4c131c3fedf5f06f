use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use super::ActorExecutor;
use super::ActorPermit;
use super::AwaitDescriptor;
use super::ResumeData;
use super::TaskAction;
use crate::proto::error::ErrorCode;
use crate::Result;
use crate::RpcError;
use crate::RpcResult;
use crate::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TaskStatus {
    Created = 0,
    Running = 1,
    Done = 2,
    Killed = 3,
    Timeout = 4,
}

impl TaskStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskStatus::Created,
            1 => TaskStatus::Running,
            2 => TaskStatus::Done,
            3 => TaskStatus::Killed,
            _ => TaskStatus::Timeout,
        }
    }
}

pub type FinishCallback = Box<dyn FnOnce(&RpcResult<()>) + Send>;

struct AwaitSlot {
    descriptor: AwaitDescriptor,
    sender: oneshot::Sender<ResumeData>,
}

#[derive(Default)]
struct FinishState {
    result: Option<RpcResult<()>>,
    callbacks: Vec<FinishCallback>,
}

pub(crate) struct TaskInner {
    id: u64,
    name: String,
    timeout: Option<Duration>,
    actor: Option<ActorExecutor>,
    status: AtomicU8,
    finished: AtomicBool,
    cancel: CancellationToken,
    await_slot: Mutex<Option<AwaitSlot>>,
    finish_state: Mutex<FinishState>,
    timer: Mutex<Option<AbortHandle>>,
    actor_permit: Mutex<Option<ActorPermit>>,
    action: Mutex<Option<Box<dyn TaskAction>>>,
}

/// Shared handle of one task action.
///
/// A task owns a single resume slot: it can be blocked on at most one
/// [`AwaitDescriptor`] at a time and only a resume carrying that exact descriptor wakes it.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
}

impl TaskHandle {
    pub(crate) fn new(
        id: u64,
        name: String,
        timeout: Option<Duration>,
        actor: Option<ActorExecutor>,
        cancel: CancellationToken,
        action: Box<dyn TaskAction>,
    ) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id,
                name,
                timeout,
                actor,
                status: AtomicU8::new(TaskStatus::Created as u8),
                finished: AtomicBool::new(false),
                cancel,
                await_slot: Mutex::new(None),
                finish_state: Mutex::new(FinishState::default()),
                timer: Mutex::new(None),
                actor_permit: Mutex::new(None),
                action: Mutex::new(Some(action)),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    pub fn actor(&self) -> Option<&ActorExecutor> {
        self.inner.actor.as_ref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.inner.status.load(Ordering::Acquire))
    }

    /// Done, killed or timed out.
    pub fn is_exiting(&self) -> bool {
        self.status() >= TaskStatus::Done
    }

    /// Killed or timed out.
    pub fn is_fault(&self) -> bool {
        self.status() >= TaskStatus::Killed
    }

    pub fn is_timeout(&self) -> bool {
        self.status() == TaskStatus::Timeout
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    /// Code a faulted task reports.
    pub fn fault_code(&self) -> Option<ErrorCode> {
        match self.status() {
            TaskStatus::Killed => Some(ErrorCode::Killed),
            TaskStatus::Timeout => Some(ErrorCode::Timeout),
            _ => None,
        }
    }

    /// Descriptor the task is currently blocked on, `None` when not suspended.
    pub fn current_await(&self) -> Option<AwaitDescriptor> {
        self.inner.await_slot.lock().as_ref().map(|slot| slot.descriptor)
    }

    /// Final result once [`TaskHandle::is_finished`] holds.
    pub fn result(&self) -> Option<RpcResult<()>> {
        self.inner.finish_state.lock().result.clone()
    }

    pub fn kill(&self) -> bool {
        self.kill_as(TaskStatus::Killed)
    }

    pub fn timeout_kill(&self) -> bool {
        self.kill_as(TaskStatus::Timeout)
    }

    fn kill_as(
        &self,
        status: TaskStatus,
    ) -> bool {
        // Status and slot change under the slot lock so a concurrent yield sees one or the other
        let slot = {
            let mut guard = self.inner.await_slot.lock();
            let updated = self
                .inner
                .status
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    (current < TaskStatus::Done as u8).then_some(status as u8)
                })
                .is_ok();
            if !updated {
                return false;
            }
            guard.take()
        };

        debug!(task_id = self.id(), task_name = %self.name(), ?status, "kill task");
        self.inner.cancel.cancel();

        if let Some(slot) = slot {
            let code = self.fault_code().unwrap_or(ErrorCode::Killed);
            let _ = slot
                .sender
                .send(ResumeData::error(slot.descriptor, RpcError::new(code)));
        }
        true
    }

    /// Delivers `data` when `descriptor` matches the current wait.
    ///
    /// Returns `Ok(false)` for a mismatch, which is dropped. Fails when the task has finished or
    /// stopped listening.
    pub fn resume(
        &self,
        descriptor: AwaitDescriptor,
        data: ResumeData,
    ) -> Result<bool> {
        if self.is_finished() {
            return Err(TaskError::TaskFinished(self.id()).into());
        }

        let slot = {
            let mut guard = self.inner.await_slot.lock();
            match guard.as_ref() {
                Some(slot) if slot.descriptor == descriptor => guard.take(),
                _ => None,
            }
        };

        match slot {
            Some(slot) => {
                slot.sender
                    .send(data)
                    .map_err(|_| TaskError::ChannelClosed(self.id()))?;
                Ok(true)
            }
            None => {
                trace!(task_id = self.id(), ?descriptor, "drop mismatched resume");
                Ok(false)
            }
        }
    }

    /// Suspends the task until a matching resume arrives.
    ///
    /// `pre_yield` runs once the wait slot is armed, so a resume it triggers synchronously is not
    /// lost. When it fails the task does not suspend. The actor permit, if held, is released for
    /// the duration of the wait. An elapsed `timeout` yields `Timeout`.
    pub async fn yield_with<F>(
        &self,
        descriptor: AwaitDescriptor,
        pre_yield: F,
        timeout: Option<Duration>,
    ) -> RpcResult<ResumeData>
    where
        F: FnOnce() -> RpcResult<()> + Send,
    {
        let receiver = self.setup_await(descriptor)?;
        if let Err(e) = pre_yield() {
            self.clear_await(descriptor);
            return Err(e);
        }

        let actor = self.release_actor_permit();
        let received = match timeout {
            Some(duration) => tokio::time::timeout(duration, receiver).await.ok(),
            None => Some(receiver.await),
        };
        self.clear_await(descriptor);
        if let Some(actor) = actor {
            self.hold_actor_permit(actor.acquire().await);
        }

        match received {
            None => Err(RpcError::new(ErrorCode::Timeout)),
            Some(Ok(data)) => Ok(data),
            Some(Err(_)) => Err(RpcError::with_source(
                ErrorCode::System,
                TaskError::ChannelClosed(self.id()),
            )),
        }
    }

    fn setup_await(
        &self,
        descriptor: AwaitDescriptor,
    ) -> RpcResult<oneshot::Receiver<ResumeData>> {
        let mut slot = self.inner.await_slot.lock();
        if let Some(code) = self.fault_code() {
            return Err(RpcError::new(code));
        }
        if let Some(current) = slot.as_ref() {
            return Err(RpcError::with_source(
                ErrorCode::System,
                TaskError::AlreadyWaiting {
                    task_id: self.id(),
                    current: current.descriptor,
                },
            ));
        }
        let (sender, receiver) = oneshot::channel();
        *slot = Some(AwaitSlot { descriptor, sender });
        Ok(receiver)
    }

    fn clear_await(
        &self,
        descriptor: AwaitDescriptor,
    ) {
        let mut slot = self.inner.await_slot.lock();
        if slot.as_ref().is_some_and(|s| s.descriptor == descriptor) {
            *slot = None;
        }
    }

    /// Registers a completion callback. After finish it runs immediately with the final result.
    pub fn init_on_finish(
        &self,
        callback: impl FnOnce(&RpcResult<()>) + Send + 'static,
    ) {
        let mut state = self.inner.finish_state.lock();
        if self.is_finished() {
            let result = state.result.clone().unwrap_or(Ok(()));
            drop(state);
            callback(&result);
            return;
        }
        state.callbacks.push(Box::new(callback));
    }

    /// Marks the task finished and fires callbacks. Only the first call has an effect.
    pub(crate) fn finish(
        &self,
        result: RpcResult<()>,
    ) -> bool {
        let callbacks = {
            let mut state = self.inner.finish_state.lock();
            if self.inner.finished.swap(true, Ordering::AcqRel) {
                return false;
            }
            state.result = Some(result.clone());
            std::mem::take(&mut state.callbacks)
        };

        let _ = self
            .inner
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < TaskStatus::Done as u8).then_some(TaskStatus::Done as u8)
            });
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.abort();
        }

        for callback in callbacks {
            callback(&result);
        }
        true
    }

    pub(crate) fn set_running(&self) {
        let _ = self.inner.status.compare_exchange(
            TaskStatus::Created as u8,
            TaskStatus::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Arms the task timer. Firing translates to [`TaskHandle::timeout_kill`].
    pub(crate) fn arm_timeout(&self) {
        let Some(timeout) = self.inner.timeout else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                TaskHandle { inner }.timeout_kill();
            }
        });
        *self.inner.timer.lock() = Some(handle.abort_handle());
    }

    pub(crate) fn take_action(&self) -> Option<Box<dyn TaskAction>> {
        self.inner.action.lock().take()
    }

    pub(crate) fn hold_actor_permit(
        &self,
        permit: ActorPermit,
    ) {
        *self.inner.actor_permit.lock() = Some(permit);
    }

    /// Drops the actor permit, returning the actor when one was held.
    pub(crate) fn release_actor_permit(&self) -> Option<ActorExecutor> {
        let permit = self.inner.actor_permit.lock().take();
        permit.and_then(|permit| {
            drop(permit);
            self.inner.actor.clone()
        })
    }
}

impl PartialEq for TaskHandle {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for TaskHandle {}

impl fmt::Debug for TaskHandle {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}
