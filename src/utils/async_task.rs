use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::error;

use crate::Result;

// Helper function to spawn tasks and track their JoinHandles
pub fn spawn_task<F, Fut>(
    name: &str,
    task_fn: F,
    handles: Option<&mut Vec<tokio::task::JoinHandle<()>>>,
) where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let name = name.to_string();
    let handle = tokio::spawn(async move {
        if let Err(e) = task_fn().await {
            error!("spawned task: {name} stopped or encountered an error: {:?}", e);
        }
    });

    if let Some(h) = handles {
        h.push(handle);
    }
}

/// Random delay in `[base / 2, base]`.
pub fn half_jitter(base: Duration) -> Duration {
    let max = base.as_millis() as u64;
    if max < 2 {
        return base;
    }
    Duration::from_millis(rand::thread_rng().gen_range(max / 2..=max))
}
