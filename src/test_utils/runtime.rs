use std::future::Future;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::proto::error::ErrorCode;
use crate::run_task_action;
use crate::AppActionLoop;
use crate::AppClock;
use crate::AppRuntime;
use crate::AwaitableContext;
use crate::FnTaskAction;
use crate::MemoryHashStore;
use crate::RedisMessageDispatcher;
use crate::RpcError;
use crate::RpcResult;
use crate::Settings;
use crate::TaskHandle;
use crate::TaskOptions;

/// Unix seconds the manual test clock starts at
pub const TEST_START_TIME: i64 = 1_700_000_000;

pub struct TestRuntime {
    pub app: Arc<AppRuntime>,
    pub store: Arc<MemoryHashStore>,
    pub dispatcher: Arc<RedisMessageDispatcher>,
    pub shutdown: CancellationToken,
}

impl Drop for TestRuntime {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn test_settings() -> Settings {
    Settings::default()
}

/// Runtime on a manual clock, backed by the in-memory store. Needs a tokio runtime.
pub fn test_runtime() -> TestRuntime {
    test_runtime_with(test_settings())
}

pub fn test_runtime_with(settings: Settings) -> TestRuntime {
    let shutdown = CancellationToken::new();
    let (app_loop, _handle) = AppActionLoop::start(shutdown.clone());
    let store = Arc::new(MemoryHashStore::new());
    let dispatcher = Arc::new(RedisMessageDispatcher::new(&settings, store.clone()));
    let app = AppRuntime::with_clock(settings, app_loop, AppClock::manual(TEST_START_TIME));
    TestRuntime {
        app,
        store,
        dispatcher,
        shutdown,
    }
}

/// Starts a task running `body` and returns its handle right away.
pub fn spawn_in_task<F, Fut>(
    app: &Arc<AppRuntime>,
    options: TaskOptions,
    body: F,
) -> TaskHandle
where
    F: FnOnce(AwaitableContext) -> Fut + Send + 'static,
    Fut: Future<Output = RpcResult<()>> + Send + 'static,
{
    let task = app
        .task_manager()
        .create_task(FnTaskAction::new("test_task", body), options);
    run_task_action(app, &task).expect("start test task");
    task
}

/// Runs `body` inside a fresh task and returns what it produced.
pub async fn run_in_task<T, F, Fut>(
    app: &Arc<AppRuntime>,
    body: F,
) -> RpcResult<T>
where
    T: Send + 'static,
    F: FnOnce(AwaitableContext) -> Fut + Send + 'static,
    Fut: Future<Output = RpcResult<T>> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    spawn_in_task(app, TaskOptions::default(), move |ctx| async move {
        let output = body(ctx).await;
        let result = output.as_ref().map(|_| ()).map_err(Clone::clone);
        let _ = tx.send(output);
        result
    });
    rx.await
        .unwrap_or_else(|_| Err(RpcError::new(ErrorCode::Killed)))
}
