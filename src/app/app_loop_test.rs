use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use super::*;
use crate::proto::error::ErrorCode;
use crate::Error;
use crate::RpcError;
use crate::SystemError;

#[tokio::test]
#[traced_test]
async fn test_app_loop_runs_actions_and_callbacks() {
    let shutdown = CancellationToken::new();
    let (app_loop, handle) = AppActionLoop::start(shutdown.clone());

    let successes = Arc::new(AtomicUsize::new(0));
    let (failed_tx, failed_rx) = oneshot::channel();

    let counter = successes.clone();
    app_loop
        .push_action(AppAction::new("ok", async { Ok(()) }).on_success(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    app_loop
        .push_action(
            AppAction::new("fail", async { Err(RpcError::new(ErrorCode::DbRecordNotFound)) })
                .on_failure(move |e| {
                    let _ = failed_tx.send(e.code());
                }),
        )
        .unwrap();

    assert_eq!(failed_rx.await.unwrap(), ErrorCode::DbRecordNotFound);
    tokio::time::timeout(Duration::from_secs(1), async {
        while successes.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    shutdown.cancel();
    handle.await.unwrap();
    assert!(logs_contain("app loop stopped"));
}

#[tokio::test]
async fn test_app_loop_polls_actions_concurrently() {
    let shutdown = CancellationToken::new();
    let (app_loop, _handle) = AppActionLoop::start(shutdown.clone());

    // The first action only completes once the second one has run
    let (gate_tx, gate_rx) = oneshot::channel::<()>();
    let (done_tx, done_rx) = oneshot::channel();
    app_loop
        .push_action(AppAction::new("blocked", async move {
            let _ = gate_rx.await;
            let _ = done_tx.send(());
            Ok(())
        }))
        .unwrap();
    app_loop
        .push_action(AppAction::new("gate", async move {
            let _ = gate_tx.send(());
            Ok(())
        }))
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), done_rx)
        .await
        .unwrap()
        .unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn test_push_action_fails_after_shutdown() {
    let shutdown = CancellationToken::new();
    let (app_loop, handle) = AppActionLoop::start(shutdown.clone());
    shutdown.cancel();
    handle.await.unwrap();

    let result = app_loop.push_action(AppAction::new("late", async { Ok(()) }));
    assert!(matches!(result, Err(Error::System(SystemError::AppLoopStopped))));
}
