use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::OnceLock;

use tracing::info;
use tracing::warn;

use super::resume_task_action;
use super::yield_task_action;
use super::DispatcherAwaitOptions;
use super::MessageDispatcher;
use crate::constants::REDIS_DISPATCHER_IDENT;
use crate::proto::error::ErrorCode;
use crate::AppAction;
use crate::AwaitableContext;
use crate::HashStore;
use crate::Result;
use crate::ResumeData;
use crate::RpcError;
use crate::RpcResult;
use crate::Settings;
use crate::StorageError;

/// Dispatcher of Redis round-trips.
///
/// Owns the store handle, the record prefix and the SHA of the CAS script. Every call goes
/// through [`RedisMessageDispatcher::execute`], which runs the IO on the app loop and suspends
/// the calling task until the reply is delivered.
pub struct RedisMessageDispatcher {
    base: MessageDispatcher,
    store: Arc<dyn HashStore>,
    record_prefix: String,
    cas_script_sha: OnceLock<String>,
}

impl RedisMessageDispatcher {
    pub fn new(
        settings: &Settings,
        store: Arc<dyn HashStore>,
    ) -> Self {
        Self {
            base: MessageDispatcher::new("RedisMessageDispatcher", REDIS_DISPATCHER_IDENT),
            store,
            record_prefix: settings.logic.redis.effective_record_prefix().to_string(),
            cas_script_sha: OnceLock::new(),
        }
    }

    /// Loads the CAS script once and caches its SHA.
    pub async fn init(&self) -> Result<()> {
        if self.cas_script_sha.get().is_some() {
            return Ok(());
        }
        let sha = self.store.load_cas_script().await?;
        info!(prefix = %self.record_prefix, sha = %sha, "redis dispatcher initialized");
        let _ = self.cas_script_sha.set(sha);
        Ok(())
    }

    pub fn base(&self) -> &MessageDispatcher {
        &self.base
    }

    pub fn store(&self) -> &Arc<dyn HashStore> {
        &self.store
    }

    pub fn record_prefix(&self) -> &str {
        &self.record_prefix
    }

    pub fn cas_script_sha(&self) -> Option<&str> {
        self.cas_script_sha.get().map(String::as_str)
    }

    /// Redis waits carry no deadline of their own; the task timer bounds them.
    pub fn create_await_options(&self) -> DispatcherAwaitOptions {
        self.base.create_await_options(None)
    }

    /// Runs `io` on the app loop and suspends the current task until its result is delivered.
    ///
    /// The IO is dropped when the task's cancellation scope fires.
    pub async fn execute<T, F, Fut>(
        &self,
        ctx: &AwaitableContext,
        name: &'static str,
        io: F,
    ) -> RpcResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn HashStore>, u64) -> Fut + Send + 'static,
        Fut: Future<Output = RpcResult<T>> + Send + 'static,
    {
        let options = self.create_await_options();
        let task = ctx.require_task()?.clone();
        let descriptor = options.descriptor();
        let sequence = options.sequence;
        let store = self.store.clone();
        let cancel = ctx.cancel_token().clone();
        let app = ctx.app().clone();

        let pre_yield = move || {
            let action = AppAction::new(name, async move {
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(RpcError::with_source(ErrorCode::RpcExiting, StorageError::Cancelled)),
                    outcome = io(store, sequence) => outcome,
                };
                let data = match outcome {
                    Ok(value) => ResumeData::ok(descriptor).with_private_data(value),
                    Err(e) => ResumeData::error(descriptor, e),
                };
                resume_task_action(&task, data).map_err(|e| {
                    warn!(task_id = task.id(), task_name = %task.name(), io = name, error = %e, "resume after redis io failed");
                    RpcError::from(e)
                })
            });
            app.push_action(action)
                .map_err(|e| RpcError::with_source(ErrorCode::System, e))
        };

        let mut data = yield_task_action(ctx, &options, pre_yield).await?;
        data.take_private_data::<T>()
    }
}

impl fmt::Debug for RedisMessageDispatcher {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("RedisMessageDispatcher")
            .field("instance_ident", &self.base.instance_ident())
            .field("record_prefix", &self.record_prefix)
            .field("cas_script_sha", &self.cas_script_sha.get())
            .finish()
    }
}
