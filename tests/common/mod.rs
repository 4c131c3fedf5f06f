#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gamesvr_core::hash_table_load;
use gamesvr_core::hash_table_update_cas;
use gamesvr_core::impl_hash_record;
use gamesvr_core::proto::error::ErrorCode;
use gamesvr_core::run_task_action;
use gamesvr_core::AppActionLoop;
use gamesvr_core::AppClock;
use gamesvr_core::AppRuntime;
use gamesvr_core::AwaitableContext;
use gamesvr_core::FnTaskAction;
use gamesvr_core::MemoryHashStore;
use gamesvr_core::RedisMessageDispatcher;
use gamesvr_core::RouterCacheFactory;
use gamesvr_core::RouterKey;
use gamesvr_core::RouterManager;
use gamesvr_core::RouterManagerBase;
use gamesvr_core::RouterManagerSet;
use gamesvr_core::RouterObject;
use gamesvr_core::RouterObjectBase;
use gamesvr_core::RpcError;
use gamesvr_core::RpcResult;
use gamesvr_core::Settings;
use gamesvr_core::TaskHandle;
use gamesvr_core::TaskOptions;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub const START_TIME: i64 = 1_700_000_000;
pub const PLAYER_TABLE: &str = "player";
pub const PLAYER_ROUTER_TYPE: u32 = 3;

pub struct TestEnv {
    pub app: Arc<AppRuntime>,
    pub store: Arc<MemoryHashStore>,
    pub dispatcher: Arc<RedisMessageDispatcher>,
    shutdown: CancellationToken,
}

impl TestEnv {
    /// Stops the app loop. Store calls pushed afterwards are never dispatched.
    pub fn stop_app_loop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// App runtime on a manual clock over the in-memory store.
pub async fn test_env(settings: Settings) -> TestEnv {
    let shutdown = CancellationToken::new();
    let (app_loop, _handle) = AppActionLoop::start(shutdown.clone());
    let store = Arc::new(MemoryHashStore::new());
    let dispatcher = Arc::new(RedisMessageDispatcher::new(&settings, store.clone()));
    dispatcher.init().await.expect("load cas script");
    let app = AppRuntime::with_clock(settings, app_loop, AppClock::manual(START_TIME));
    TestEnv {
        app,
        store,
        dispatcher,
        shutdown,
    }
}

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
        .create_task(FnTaskAction::new("integration", body), options);
    run_task_action(app, &task).expect("start task");
    task
}

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
    rx.await.unwrap_or_else(|_| Err(RpcError::new(ErrorCode::Killed)))
}

pub async fn until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PlayerRecord {
    #[prost(uint64, tag = "1")]
    pub uid: u64,
    #[prost(uint32, tag = "2")]
    pub lv: u32,
    #[prost(string, tag = "3")]
    pub nickname: String,
}

impl_hash_record!(PlayerRecord { uid, lv, nickname });

pub fn player_index(uid: u64) -> String {
    format!("player:{uid}")
}

pub fn player_key(uid: u64) -> RouterKey {
    RouterKey::new(PLAYER_ROUTER_TYPE, 1, uid)
}

/// Call counters and scripted pull failures shared by every player object.
#[derive(Default)]
pub struct PlayerStats {
    pub pull_failures: Mutex<VecDeque<ErrorCode>>,
    pub pulls: AtomicUsize,
    pub saves: AtomicUsize,
}

impl PlayerStats {
    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

/// Router object persisted as one hash per player.
pub struct PlayerObject {
    base: RouterObjectBase,
    dispatcher: Arc<RedisMessageDispatcher>,
    stats: Arc<PlayerStats>,
    record: Mutex<PlayerRecord>,
    cas_version: Mutex<u64>,
}

impl std::fmt::Debug for PlayerObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerObject").finish_non_exhaustive()
    }
}

impl PlayerObject {
    pub fn record(&self) -> PlayerRecord {
        self.record.lock().clone()
    }

    pub fn level_up(&self) {
        self.record.lock().lv += 1;
    }

    fn uid(&self) -> u64 {
        self.base.key().object_id
    }
}

#[async_trait]
impl RouterObject for PlayerObject {
    type PrivateData = ();

    fn base(&self) -> &RouterObjectBase {
        &self.base
    }

    async fn pull_object(
        &self,
        ctx: &AwaitableContext,
        _private_data: &(),
    ) -> RpcResult<()> {
        self.stats.pulls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.stats.pull_failures.lock().pop_front();
        if let Some(code) = scripted {
            return Err(RpcError::new(code));
        }

        let index = player_index(self.uid());
        let (record, cas_version) = match hash_table_load::<PlayerRecord>(ctx, &self.dispatcher, PLAYER_TABLE, &index).await {
            Ok(loaded) => loaded,
            Err(e) if e.is(ErrorCode::DbRecordNotFound) => (
                PlayerRecord {
                    uid: self.uid(),
                    lv: 1,
                    nickname: format!("player-{}", self.uid()),
                },
                0,
            ),
            Err(e) => return Err(e),
        };
        *self.record.lock() = record;
        *self.cas_version.lock() = cas_version;

        let version = self.base.router_server_version() + 1;
        self.base.set_router_server(ctx.app().logic_id(), version);
        Ok(())
    }

    async fn save_object(
        &self,
        ctx: &AwaitableContext,
        _private_data: &(),
    ) -> RpcResult<()> {
        self.stats.saves.fetch_add(1, Ordering::SeqCst);
        let record = self.record();
        let mut cas_version = *self.cas_version.lock();
        let index = player_index(self.uid());
        hash_table_update_cas(ctx, &self.dispatcher, PLAYER_TABLE, &index, &record, &mut cas_version, false).await?;
        *self.cas_version.lock() = cas_version;
        Ok(())
    }
}

pub fn player_factory(
    dispatcher: Arc<RedisMessageDispatcher>,
    stats: Arc<PlayerStats>,
) -> RouterCacheFactory<PlayerObject> {
    Arc::new(move |ctx: &AwaitableContext, key: RouterKey| {
        Arc::new(PlayerObject {
            base: RouterObjectBase::new(key, ctx.sys_now()),
            dispatcher: dispatcher.clone(),
            stats: stats.clone(),
            record: Mutex::new(PlayerRecord::default()),
            cas_version: Mutex::new(0),
        })
    })
}

pub struct PlayerRouter {
    pub set: Arc<RouterManagerSet>,
    pub manager: Arc<RouterManager<PlayerObject>>,
    pub stats: Arc<PlayerStats>,
}

pub fn player_router(env: &TestEnv) -> PlayerRouter {
    let set = RouterManagerSet::new(env.app.clone());
    let stats = Arc::new(PlayerStats::default());
    let manager = RouterManager::new(
        &set,
        "player",
        PLAYER_ROUTER_TYPE,
        player_factory(env.dispatcher.clone(), stats.clone()),
    );
    set.register_manager(manager.clone() as Arc<dyn RouterManagerBase>)
        .expect("register player manager");
    PlayerRouter { set, manager, stats }
}

impl PlayerRouter {
    pub async fn writable(
        &self,
        env: &TestEnv,
        uid: u64,
    ) -> Arc<PlayerObject> {
        let manager = self.manager.clone();
        run_in_task(&env.app, move |ctx| async move {
            manager.mutable_object(&ctx, player_key(uid), &()).await
        })
        .await
        .expect("mutable player object")
    }
}
