mod common;

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::spawn_in_task;
use common::test_env;
use common::until;
use gamesvr_core::proto::error::ErrorCode;
use gamesvr_core::AwaitDescriptor;
use gamesvr_core::ResumeData;
use gamesvr_core::RpcResult;
use gamesvr_core::Settings;
use gamesvr_core::TaskOptions;
use gamesvr_core::TaskStatus;
use gamesvr_core::WaitType;
use parking_lot::Mutex;
use tokio::sync::oneshot;

const RPC_7: AwaitDescriptor = AwaitDescriptor::new(WaitType::Rpc, 7);

#[tokio::test]
async fn test_timeout_kill_wakes_blocked_task() {
    let env = test_env(Settings::default()).await;
    let (yield_tx, yield_rx) = oneshot::channel();
    let task = spawn_in_task(&env.app, TaskOptions::default(), move |ctx| async move {
        let task = ctx.require_task()?.clone();
        let data = task.yield_with(RPC_7, || Ok(()), None).await?;
        let _ = yield_tx.send(data.result.clone());
        data.result
    });

    let finish_calls = Arc::new(AtomicUsize::new(0));
    let finish_result: Arc<Mutex<Option<RpcResult<()>>>> = Arc::default();
    {
        let calls = finish_calls.clone();
        let seen = finish_result.clone();
        task.init_on_finish(move |result| {
            calls.fetch_add(1, Ordering::SeqCst);
            *seen.lock() = Some(result.clone());
        });
    }
    until(|| task.current_await() == Some(RPC_7)).await;

    assert!(task.timeout_kill());
    let woke_with = tokio::time::timeout(Duration::from_millis(50), yield_rx)
        .await
        .expect("yield returns right after the kill")
        .unwrap();
    assert!(woke_with.unwrap_err().is(ErrorCode::Timeout));

    until(|| task.is_finished()).await;
    assert!(!matches!(task.resume(RPC_7, ResumeData::ok(RPC_7)), Ok(true)));
    assert_eq!(task.status(), TaskStatus::Timeout);

    // Late kills and resumes must not finish the task again
    assert!(!task.timeout_kill());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(finish_calls.load(Ordering::SeqCst), 1);
    let result = finish_result.lock().clone().unwrap();
    assert!(result.unwrap_err().is(ErrorCode::Timeout));
}

#[tokio::test]
async fn test_on_finish_registered_late_runs_once() {
    let env = test_env(Settings::default()).await;
    let task = spawn_in_task(&env.app, TaskOptions::default(), |_ctx| async { Ok(()) });
    until(|| task.is_finished()).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    task.init_on_finish(move |result| {
        assert!(result.is_ok());
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
