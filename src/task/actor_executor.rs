//! Per-owner serial execution.
//!
//! An [`ActorExecutor`] is held by a business owner (for example a user). Task bodies bound to
//! it run one at a time between yield points, and callbacks posted to it run in FIFO order.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::trace;

use crate::constants::ACTOR_ACTIONS_PER_ROUND;
use crate::constants::ACTOR_MAX_PENDING_ACTIONS;
use crate::Result;
use crate::SystemError;

type ActorCallback = Box<dyn FnOnce() + Send>;

/// Proof of exclusive execution on one actor.
pub type ActorPermit = OwnedMutexGuard<()>;

static NEXT_ACTOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct ActorExecutor {
    inner: Arc<ActorInner>,
}

struct ActorInner {
    id: u64,
    name: String,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    queue: Mutex<VecDeque<ActorCallback>>,
    draining: AtomicBool,
    max_pending: usize,
}

impl ActorExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, ACTOR_MAX_PENDING_ACTIONS)
    }

    pub fn with_capacity(
        name: impl Into<String>,
        max_pending: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ActorInner {
                id: NEXT_ACTOR_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                run_lock: Arc::new(tokio::sync::Mutex::new(())),
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                max_pending,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn pending_count(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Waits for exclusive execution. Waiters are served in FIFO order.
    pub async fn acquire(&self) -> ActorPermit {
        self.inner.run_lock.clone().lock_owned().await
    }

    /// Queues a callback. It runs after every callback posted before it and never
    /// concurrently with a task body bound to this actor.
    pub fn post(
        &self,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() >= self.inner.max_pending {
                return Err(SystemError::ActorQueueFull {
                    actor: self.inner.name.clone(),
                    pending: queue.len(),
                }
                .into());
            }
            queue.push_back(Box::new(callback));
        }

        if !self.inner.draining.swap(true, Ordering::AcqRel) {
            let actor = self.clone();
            tokio::spawn(async move { actor.drain().await });
        }
        Ok(())
    }

    async fn drain(self) {
        loop {
            let permit = self.acquire().await;
            let mut ran = 0;
            while ran < ACTOR_ACTIONS_PER_ROUND {
                let next = self.inner.queue.lock().pop_front();
                match next {
                    Some(callback) => {
                        callback();
                        ran += 1;
                    }
                    None => break,
                }
            }
            drop(permit);
            trace!(actor = %self.inner.name, ran, "actor drain round");

            if self.inner.queue.lock().is_empty() {
                self.inner.draining.store(false, Ordering::Release);
                // A post may have slipped in between the check and the store
                if self.inner.queue.lock().is_empty() || self.inner.draining.swap(true, Ordering::AcqRel) {
                    return;
                }
            }
            tokio::task::yield_now().await;
        }
    }
}

impl fmt::Debug for ActorExecutor {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ActorExecutor")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}
