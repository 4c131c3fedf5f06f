use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing_test::traced_test;

use super::*;
use crate::proto::error::ErrorCode;
use crate::RpcError;
use crate::RpcResult;
use crate::test_utils::spawn_in_task;
use crate::test_utils::test_runtime;

const RPC_7: AwaitDescriptor = AwaitDescriptor::new(WaitType::Rpc, 7);

async fn until_blocked(
    task: &TaskHandle,
    descriptor: AwaitDescriptor,
) {
    for _ in 0..200 {
        if task.current_await() == Some(descriptor) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {} never blocked on {descriptor:?}", task.id());
}

async fn until_finished(task: &TaskHandle) {
    for _ in 0..200 {
        if task.is_finished() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {} never finished", task.id());
}

/// Task blocked on `descriptor`, reporting what its yield returned.
fn blocked_task(
    rt: &crate::test_utils::TestRuntime,
    options: TaskOptions,
    descriptor: AwaitDescriptor,
) -> (TaskHandle, oneshot::Receiver<RpcResult<ResumeData>>) {
    let (tx, rx) = oneshot::channel();
    let task = spawn_in_task(&rt.app, options, move |ctx| async move {
        let task = ctx.require_task()?.clone();
        let outcome = task.yield_with(descriptor, || Ok(()), None).await;
        let result = match &outcome {
            Ok(data) => data.result.clone(),
            Err(e) => Err(e.clone()),
        };
        let _ = tx.send(outcome);
        result
    });
    (task, rx)
}

#[tokio::test]
async fn test_matching_resume_delivers_data() {
    let rt = test_runtime();
    let (task, rx) = blocked_task(&rt, TaskOptions::default(), RPC_7);
    until_blocked(&task, RPC_7).await;

    let data = ResumeData::ok(RPC_7).with_private_data(42u32);
    assert!(task.resume(RPC_7, data).unwrap());

    let mut data = rx.await.unwrap().unwrap();
    assert_eq!(data.descriptor, RPC_7);
    assert_eq!(data.take_private_data::<u32>().unwrap(), 42);
    until_finished(&task).await;
    assert_eq!(task.status(), TaskStatus::Done);
    assert!(task.result().unwrap().is_ok());
}

#[tokio::test]
async fn test_mismatched_resume_is_dropped() {
    let rt = test_runtime();
    let (task, rx) = blocked_task(&rt, TaskOptions::default(), RPC_7);
    until_blocked(&task, RPC_7).await;

    let other = AwaitDescriptor::new(WaitType::Rpc, 8);
    assert!(!task.resume(other, ResumeData::ok(other)).unwrap());
    let io = AwaitDescriptor::new(WaitType::Io(7), 7);
    assert!(!task.resume(io, ResumeData::ok(io)).unwrap());
    assert_eq!(task.current_await(), Some(RPC_7));

    let failure = ResumeData::error(RPC_7, RpcError::new(ErrorCode::Busy));
    assert!(task.resume(RPC_7, failure).unwrap());
    let data = rx.await.unwrap().unwrap();
    assert!(data.result.unwrap_err().is(ErrorCode::Busy));
}

#[tokio::test]
async fn test_private_data_type_is_checked() {
    let mut data = ResumeData::ok(RPC_7).with_private_data("text");
    let err = data.take_private_data::<u64>().unwrap_err();
    assert!(err.is(ErrorCode::System));

    let mut empty = ResumeData::ok(RPC_7);
    assert!(empty.take_private_data::<u64>().unwrap_err().is(ErrorCode::System));
}

#[tokio::test]
#[traced_test]
async fn test_timeout_kill_unblocks_yield() {
    let rt = test_runtime();
    let (task, rx) = blocked_task(&rt, TaskOptions::default(), RPC_7);
    let finish_calls = Arc::new(AtomicUsize::new(0));
    let finish_result = Arc::new(Mutex::new(None));
    {
        let calls = finish_calls.clone();
        let seen = finish_result.clone();
        task.init_on_finish(move |result| {
            calls.fetch_add(1, Ordering::SeqCst);
            *seen.lock() = Some(result.clone());
        });
    }
    until_blocked(&task, RPC_7).await;

    assert!(task.timeout_kill());
    assert!(task.is_timeout());
    assert!(task.cancel_token().is_cancelled());

    let data = tokio::time::timeout(Duration::from_millis(100), rx)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(data.result.unwrap_err().is(ErrorCode::Timeout));

    until_finished(&task).await;
    assert!(!matches!(task.resume(RPC_7, ResumeData::ok(RPC_7)), Ok(true)));
    assert!(!task.kill());
    assert_eq!(finish_calls.load(Ordering::SeqCst), 1);
    let result = finish_result.lock().clone().unwrap();
    assert!(result.unwrap_err().is(ErrorCode::Timeout));
    assert_eq!(task.status(), TaskStatus::Timeout);
    assert!(logs_contain("kill task"));
}

#[tokio::test]
async fn test_armed_timer_times_out_task() {
    let rt = test_runtime();
    let options = TaskOptions::with_timeout(Some(Duration::from_millis(30)));
    let (task, rx) = blocked_task(&rt, options, RPC_7);

    let data = rx.await.unwrap().unwrap();
    assert!(data.result.unwrap_err().is(ErrorCode::Timeout));
    until_finished(&task).await;
    assert!(task.is_fault());
    assert_eq!(task.fault_code(), Some(ErrorCode::Timeout));
}

#[tokio::test]
async fn test_yield_after_kill_fails_fast() {
    let rt = test_runtime();
    let (tx, rx) = oneshot::channel();
    let (go_tx, go_rx) = oneshot::channel::<()>();
    let task = spawn_in_task(&rt.app, TaskOptions::default(), move |ctx| async move {
        let _ = go_rx.await;
        let task = ctx.require_task()?.clone();
        let _ = tx.send(task.yield_with(RPC_7, || Ok(()), None).await.map(|_| ()));
        Ok(())
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(task.kill());
    go_tx.send(()).unwrap();

    let err = rx.await.unwrap().unwrap_err();
    assert!(err.is(ErrorCode::Killed));
    until_finished(&task).await;
    assert!(task.result().unwrap().unwrap_err().is(ErrorCode::Killed));
}

#[tokio::test]
async fn test_pre_yield_resume_is_not_lost() {
    let rt = test_runtime();
    let task = spawn_in_task(&rt.app, TaskOptions::default(), move |ctx| async move {
        let task = ctx.require_task()?.clone();
        let waker = task.clone();
        let data = task
            .yield_with(
                RPC_7,
                move || {
                    waker.resume(RPC_7, ResumeData::ok(RPC_7))?;
                    Ok(())
                },
                Some(Duration::from_secs(1)),
            )
            .await?;
        data.result
    });

    until_finished(&task).await;
    assert!(task.result().unwrap().is_ok());
}

#[tokio::test]
async fn test_failed_pre_yield_does_not_suspend() {
    let rt = test_runtime();
    let task = spawn_in_task(&rt.app, TaskOptions::default(), move |ctx| async move {
        let task = ctx.require_task()?.clone();
        let err = task
            .yield_with(RPC_7, || Err(RpcError::new(ErrorCode::RpcSendFailed)), None)
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::RpcSendFailed));
        assert_eq!(task.current_await(), None);
        Ok(())
    });

    until_finished(&task).await;
    assert!(task.result().unwrap().is_ok());
}

#[tokio::test]
async fn test_resume_of_finished_task_fails() {
    let rt = test_runtime();
    let task = spawn_in_task(&rt.app, TaskOptions::default(), |_ctx| async { Ok(()) });
    until_finished(&task).await;

    let err = task.resume(RPC_7, ResumeData::ok(RPC_7)).unwrap_err();
    assert!(matches!(err, crate::Error::Task(crate::TaskError::TaskFinished(_))));
}

#[tokio::test]
async fn test_on_finish_after_finish_runs_immediately() {
    let rt = test_runtime();
    let task = spawn_in_task(&rt.app, TaskOptions::default(), |_ctx| async {
        Err(RpcError::new(ErrorCode::Busy))
    });
    until_finished(&task).await;

    let (tx, rx) = std::sync::mpsc::channel();
    task.init_on_finish(move |result| {
        tx.send(result.clone()).unwrap();
    });
    let result = rx.try_recv().unwrap();
    assert!(result.unwrap_err().is(ErrorCode::Busy));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_kill_racing_yield_always_wakes() {
    let rt = test_runtime();
    for round in 0..200 {
        let (go_tx, go_rx) = oneshot::channel::<()>();
        let (tx, rx) = oneshot::channel();
        let task = spawn_in_task(&rt.app, TaskOptions::default(), move |ctx| async move {
            let _ = go_rx.await;
            let task = ctx.require_task()?.clone();
            let _ = tx.send(task.yield_with(RPC_7, || Ok(()), None).await.map(|_| ()));
            Ok(())
        });

        let killer = task.clone();
        let kill = tokio::spawn(async move {
            tokio::task::yield_now().await;
            killer.kill()
        });
        let _ = go_tx.send(());

        let outcome = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap_or_else(|_| panic!("yield never returned in round {round}"));
        // A kill landing before the body starts drops the sender unused
        if let Ok(outcome) = outcome {
            assert!(outcome.unwrap_err().is(ErrorCode::Killed));
        }
        assert!(kill.await.unwrap());
        until_finished(&task).await;
    }
}
