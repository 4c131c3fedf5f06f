use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::FutureExt;
use futures::StreamExt;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::Result;
use crate::RpcError;
use crate::RpcResult;
use crate::SystemError;

type SuccessCallback = Box<dyn FnOnce() + Send>;
type FailureCallback = Box<dyn FnOnce(RpcError) + Send>;

/// Work scheduled on the app loop. The future owns the job of resuming whichever task waits
/// for it, on success and on failure.
pub struct AppAction {
    name: &'static str,
    future: BoxFuture<'static, RpcResult<()>>,
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
}

impl AppAction {
    pub fn new(
        name: &'static str,
        future: impl Future<Output = RpcResult<()>> + Send + 'static,
    ) -> Self {
        Self {
            name,
            future: future.boxed(),
            on_success: None,
            on_failure: None,
        }
    }

    pub fn on_success(
        mut self,
        callback: impl FnOnce() + Send + 'static,
    ) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_failure(
        mut self,
        callback: impl FnOnce(RpcError) + Send + 'static,
    ) -> Self {
        self.on_failure = Some(Box::new(callback));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Drives the action to completion and fires the matching callback.
    pub async fn execute(self) {
        let name = self.name;
        match self.future.await {
            Ok(()) => {
                if let Some(callback) = self.on_success {
                    callback();
                }
            }
            Err(e) => {
                warn!(action = name, error = %e, "app action failed");
                if let Some(callback) = self.on_failure {
                    callback(e);
                }
            }
        }
    }
}

impl fmt::Debug for AppAction {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("AppAction").field("name", &self.name).finish()
    }
}

/// The single place allowed to talk to Redis and transports.
#[cfg_attr(test, automock)]
pub trait AppLoop: Send + Sync + 'static {
    fn push_action(
        &self,
        action: AppAction,
    ) -> Result<()>;
}

/// Channel-fed app loop. All actions are polled from one tokio task, concurrently with each
/// other, so blocking on one Redis round-trip never stalls the rest.
pub struct AppActionLoop {
    sender: mpsc::UnboundedSender<AppAction>,
}

impl AppActionLoop {
    pub fn start(shutdown: CancellationToken) -> (Arc<Self>, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Self::run(receiver, shutdown));
        (Arc::new(Self { sender }), handle)
    }

    async fn run(
        mut receiver: mpsc::UnboundedReceiver<AppAction>,
        shutdown: CancellationToken,
    ) {
        let mut in_flight = FuturesUnordered::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(in_flight = in_flight.len(), "app loop stopped");
                    return;
                }
                action = receiver.recv() => match action {
                    Some(action) => in_flight.push(action.execute()),
                    None => {
                        // Every sender is gone: finish what was already accepted
                        warn!(in_flight = in_flight.len(), "app loop closed without shutdown signal");
                        while in_flight.next().await.is_some() {}
                        return;
                    }
                },
                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
            }
        }
    }
}

impl AppLoop for AppActionLoop {
    fn push_action(
        &self,
        action: AppAction,
    ) -> Result<()> {
        self.sender
            .send(action)
            .map_err(|_| SystemError::AppLoopStopped.into())
    }
}
