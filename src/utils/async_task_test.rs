use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::utils::async_task::half_jitter;
use crate::utils::async_task::spawn_task;
use crate::Error;

#[tokio::test]
async fn test_spawn_task_tracks_handles() {
    let counter = Arc::new(AtomicU32::new(0));
    let mut handles = Vec::new();

    for _ in 0..3 {
        let counter = counter.clone();
        spawn_task(
            "counter",
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            Some(&mut handles),
        );
    }
    assert_eq!(handles.len(), 3);

    join_all(handles).await;
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_spawn_task_swallows_errors() {
    let mut handles = Vec::new();
    spawn_task(
        "failing",
        || async { Err(Error::Fatal("boom".to_string())) },
        Some(&mut handles),
    );

    for result in join_all(handles).await {
        assert!(result.is_ok());
    }
}

#[test]
fn test_half_jitter_stays_in_range() {
    let base = Duration::from_millis(512);
    for _ in 0..100 {
        let delay = half_jitter(base);
        assert!(delay >= Duration::from_millis(256));
        assert!(delay <= base);
    }
    assert_eq!(half_jitter(Duration::from_millis(1)), Duration::from_millis(1));
}
