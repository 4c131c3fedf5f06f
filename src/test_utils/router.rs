use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::proto::error::ErrorCode;
use crate::wait;
use crate::ActorExecutor;
use crate::AwaitableContext;
use crate::RouterCacheFactory;
use crate::RouterKey;
use crate::RouterManager;
use crate::RouterManagerBase;
use crate::RouterManagerSet;
use crate::RouterObject;
use crate::RouterObjectBase;
use crate::RpcError;
use crate::RpcResult;

pub const TEST_ROUTER_TYPE: u32 = 7;

/// Behaviour and call counters shared by every object a test factory creates.
#[derive(Default)]
pub struct RouterScript {
    /// Outcomes of the next pulls, `Ok` once drained
    pub pull_results: Mutex<VecDeque<ErrorCode>>,
    pub pull_cache_count: AtomicUsize,
    pub pull_object_count: AtomicUsize,
    pub save_count: AtomicUsize,
    pub fail_saves: AtomicBool,
    /// Router server id reported by pulls, 0 for unowned
    pub owner: AtomicU64,
    /// Time a save holds the IO slot
    pub save_delay_ms: AtomicU64,
    pub with_actor: AtomicBool,
}

impl RouterScript {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_pull_results(
        &self,
        codes: impl IntoIterator<Item = ErrorCode>,
    ) {
        self.pull_results.lock().extend(codes);
    }

    pub fn pulls(&self) -> usize {
        self.pull_object_count.load(Ordering::SeqCst)
    }

    pub fn saves(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }

    fn next_pull(&self) -> RpcResult<()> {
        match self.pull_results.lock().pop_front() {
            None | Some(ErrorCode::Success) => Ok(()),
            Some(code) => Err(RpcError::new(code)),
        }
    }
}

pub struct TestRouterObject {
    base: RouterObjectBase,
    script: Arc<RouterScript>,
    actor: Option<ActorExecutor>,
}

impl std::fmt::Debug for TestRouterObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestRouterObject").finish_non_exhaustive()
    }
}

impl TestRouterObject {
    pub fn new(
        key: RouterKey,
        now: i64,
        script: Arc<RouterScript>,
    ) -> Self {
        let actor = script
            .with_actor
            .load(Ordering::SeqCst)
            .then(|| ActorExecutor::new(format!("actor-{key}")));
        Self {
            base: RouterObjectBase::new(key, now),
            script,
            actor,
        }
    }
}

#[async_trait]
impl RouterObject for TestRouterObject {
    type PrivateData = ();

    fn base(&self) -> &RouterObjectBase {
        &self.base
    }

    async fn pull_cache(
        &self,
        _ctx: &AwaitableContext,
        _private_data: &(),
    ) -> RpcResult<()> {
        self.script.pull_cache_count.fetch_add(1, Ordering::SeqCst);
        self.script.next_pull()
    }

    async fn pull_object(
        &self,
        _ctx: &AwaitableContext,
        _private_data: &(),
    ) -> RpcResult<()> {
        self.script.pull_object_count.fetch_add(1, Ordering::SeqCst);
        self.script.next_pull()?;
        let version = self.base.router_server_version();
        self.base
            .set_router_server(self.script.owner.load(Ordering::SeqCst), version);
        Ok(())
    }

    async fn save_object(
        &self,
        ctx: &AwaitableContext,
        _private_data: &(),
    ) -> RpcResult<()> {
        self.script.save_count.fetch_add(1, Ordering::SeqCst);
        let delay = self.script.save_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            wait(ctx, Duration::from_millis(delay)).await?;
        }
        if self.script.fail_saves.load(Ordering::SeqCst) {
            return Err(RpcError::new(ErrorCode::System));
        }
        Ok(())
    }

    fn actor(&self) -> Option<ActorExecutor> {
        self.actor.clone()
    }
}

pub fn test_router_factory(script: Arc<RouterScript>) -> RouterCacheFactory<TestRouterObject> {
    Arc::new(move |ctx: &AwaitableContext, key: RouterKey| {
        Arc::new(TestRouterObject::new(key, ctx.sys_now(), script.clone()))
    })
}

/// Registered test manager of [`TEST_ROUTER_TYPE`].
pub fn test_router_manager(
    set: &Arc<RouterManagerSet>,
    script: Arc<RouterScript>,
) -> Arc<RouterManager<TestRouterObject>> {
    let manager = RouterManager::new(set, "test", TEST_ROUTER_TYPE, test_router_factory(script));
    set.register_manager(manager.clone() as Arc<dyn RouterManagerBase>)
        .expect("register test manager");
    manager
}

pub fn test_key(object_id: u64) -> RouterKey {
    RouterKey::new(TEST_ROUTER_TYPE, 1, object_id)
}
