//! Router object: a cache of a game entity that can be promoted to the writable entity owned by
//! this process.

use std::any::Any;
use std::fmt;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use tracing::error;

use super::FlagGuard;
use super::IoSlot;
use super::IoTaskGuard;
use super::RouterKey;
use super::RouterObjectFlag;
use super::TimerListKind;
use crate::proto::error::ErrorCode;
use crate::ActorExecutor;
use crate::AwaitableContext;
use crate::RpcError;
use crate::RpcResult;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct ObjectState {
    last_save_time: i64,
    last_visit_time: i64,
    router_server_id: u64,
    router_server_version: u64,
    saving_sequence: u64,
    saved_sequence: u64,
    timer_sequence: u64,
    timer_list: Option<TimerListKind>,
}

/// State shared by every router object: key, flags, timestamps, routing and IO bookkeeping.
pub struct RouterObjectBase {
    key: RouterKey,
    flags: AtomicU32,
    state: Mutex<ObjectState>,
    io: Arc<IoSlot>,
}

impl RouterObjectBase {
    /// A fresh object counts as visited at `now`.
    pub fn new(
        key: RouterKey,
        now: i64,
    ) -> Self {
        let handle_id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            key,
            flags: AtomicU32::new(0),
            state: Mutex::new(ObjectState {
                last_visit_time: now,
                ..Default::default()
            }),
            io: Arc::new(IoSlot::new(handle_id)),
        }
    }

    pub fn key(&self) -> RouterKey {
        self.key
    }

    pub(crate) fn io_slot(&self) -> &Arc<IoSlot> {
        &self.io
    }

    pub fn flags(&self) -> RouterObjectFlag {
        RouterObjectFlag::from_bits(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flag(
        &self,
        flag: RouterObjectFlag,
    ) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn unset_flag(
        &self,
        flag: RouterObjectFlag,
    ) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    /// True when every bit of `flag` is set.
    pub fn check_flag(
        &self,
        flag: RouterObjectFlag,
    ) -> bool {
        self.flags().contains(flag)
    }

    /// Visiting cancels a pending cache removal.
    pub fn refresh_visit_time(
        &self,
        now: i64,
    ) {
        self.state.lock().last_visit_time = now;
        self.unset_flag(RouterObjectFlag::REMOVING_CACHE);
    }

    pub fn refresh_save_time(
        &self,
        now: i64,
    ) {
        self.state.lock().last_save_time = now;
    }

    pub fn last_visit_time(&self) -> i64 {
        self.state.lock().last_visit_time
    }

    pub fn last_save_time(&self) -> i64 {
        self.state.lock().last_save_time
    }

    pub fn is_writable(&self) -> bool {
        let flags = self.flags();
        flags.contains(RouterObjectFlag::IS_OBJECT)
            && !flags.contains(RouterObjectFlag::FORCE_PULL_OBJECT)
            && !flags.contains(RouterObjectFlag::CACHE_REMOVED)
    }

    pub fn is_pulling_cache(&self) -> bool {
        self.check_flag(RouterObjectFlag::PULLING_CACHE)
    }

    /// Servable as a cache: writable, or refreshed within `router.cache_update_interval`.
    pub fn is_cache_available(
        &self,
        ctx: &AwaitableContext,
    ) -> bool {
        if self.is_pulling_cache() {
            return false;
        }
        if self.is_writable() {
            return true;
        }
        let window = ctx.settings().router.cache_update_interval;
        self.last_save_time() + window >= ctx.sys_now()
    }

    pub fn is_object_available(&self) -> bool {
        !self.check_flag(RouterObjectFlag::PULLING_OBJECT) && self.is_writable()
    }

    /// Promotes to a writable entity and cancels every removal intent.
    pub fn upgrade(
        &self,
        now: i64,
    ) {
        if self.check_flag(RouterObjectFlag::IS_OBJECT) {
            return;
        }
        self.refresh_visit_time(now);
        self.set_flag(RouterObjectFlag::IS_OBJECT);
        self.unset_flag(
            RouterObjectFlag::CACHE_REMOVED
                | RouterObjectFlag::FORCE_REMOVE_OBJECT
                | RouterObjectFlag::SCHED_REMOVE_OBJECT
                | RouterObjectFlag::SCHED_REMOVE_CACHE,
        );
    }

    pub fn downgrade(
        &self,
        now: i64,
    ) {
        if !self.check_flag(RouterObjectFlag::IS_OBJECT) {
            return;
        }
        self.refresh_visit_time(now);
        self.unset_flag(RouterObjectFlag::IS_OBJECT);
    }

    pub fn router_server_id(&self) -> u64 {
        self.state.lock().router_server_id
    }

    pub fn router_server_version(&self) -> u64 {
        self.state.lock().router_server_version
    }

    /// Routing as read from the store, usually called from `pull_object`.
    pub fn set_router_server(
        &self,
        server_id: u64,
        version: u64,
    ) {
        let mut state = self.state.lock();
        state.router_server_id = server_id;
        state.router_server_version = version;
    }

    pub fn saving_sequence(&self) -> u64 {
        self.state.lock().saving_sequence
    }

    pub fn saved_sequence(&self) -> u64 {
        self.state.lock().saved_sequence
    }

    fn next_saving_sequence(&self) -> u64 {
        let mut state = self.state.lock();
        state.saving_sequence += 1;
        state.saving_sequence
    }

    fn mark_saved(
        &self,
        sequence: u64,
    ) {
        let mut state = self.state.lock();
        if sequence > state.saved_sequence {
            state.saved_sequence = sequence;
        }
    }

    /// Id of the task doing IO on this object, 0 when idle.
    pub fn await_task_id(&self) -> u64 {
        self.io.holder_id()
    }

    pub fn is_io_running(&self) -> bool {
        self.await_task_id() != 0
    }

    /// Tasks queued behind the current IO holder.
    pub fn io_waiter_count(&self) -> usize {
        self.io.waiter_count()
    }

    pub fn alloc_timer_sequence(&self) -> u64 {
        let mut state = self.state.lock();
        state.timer_sequence += 1;
        state.timer_sequence
    }

    pub fn check_timer_sequence(
        &self,
        sequence: u64,
    ) -> bool {
        self.state.lock().timer_sequence == sequence
    }

    /// Timer list holding the live timer of this object.
    pub fn timer_list(&self) -> Option<TimerListKind> {
        self.state.lock().timer_list
    }

    pub(crate) fn reset_timer_ref(
        &self,
        list: TimerListKind,
        sequence: u64,
    ) {
        let mut state = self.state.lock();
        if state.timer_sequence == sequence {
            state.timer_list = Some(list);
        }
    }

    /// Forgets the timer reference if `(list, sequence)` is the live one.
    pub(crate) fn check_and_remove_timer_ref(
        &self,
        list: TimerListKind,
        sequence: u64,
    ) {
        let mut state = self.state.lock();
        if state.timer_list == Some(list) && state.timer_sequence == sequence {
            state.timer_list = None;
        }
    }

    /// Detaches from any timer list. The queued timer becomes stale and is dropped on expiry.
    pub fn unset_timer_ref(&self) {
        let mut state = self.state.lock();
        state.timer_sequence += 1;
        state.timer_list = None;
    }
}

impl fmt::Debug for RouterObjectBase {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("RouterObjectBase")
            .field("key", &self.key)
            .field("flags", &self.flags())
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Business side of a router object.
///
/// Implementors embed a [`RouterObjectBase`] and provide the three IO hooks. `pull_cache`
/// defaults to a full `pull_object`.
#[async_trait]
pub trait RouterObject: Send + Sync + 'static {
    /// Extra input of the IO hooks. Background jobs pass the default value.
    type PrivateData: Default + Send + Sync + 'static;

    fn base(&self) -> &RouterObjectBase;

    async fn pull_cache(
        &self,
        ctx: &AwaitableContext,
        private_data: &Self::PrivateData,
    ) -> RpcResult<()> {
        self.pull_object(ctx, private_data).await
    }

    async fn pull_object(
        &self,
        ctx: &AwaitableContext,
        private_data: &Self::PrivateData,
    ) -> RpcResult<()>;

    async fn save_object(
        &self,
        ctx: &AwaitableContext,
        private_data: &Self::PrivateData,
    ) -> RpcResult<()>;

    /// Owner whose actor serializes timer callbacks and background saves of this object.
    fn actor(&self) -> Option<ActorExecutor> {
        None
    }
}

/// Type-erased view of a router object, as kept by timers and the manager set.
#[async_trait]
pub trait ManagedObject: Send + Sync + 'static {
    fn router_base(&self) -> &RouterObjectBase;

    fn actor_executor(&self) -> Option<ActorExecutor>;

    /// [`internal_save_object`] with default private data.
    async fn save_with_default_data(
        &self,
        ctx: &AwaitableContext,
        guard: &mut IoTaskGuard,
    ) -> RpcResult<()>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[async_trait]
impl<T: RouterObject> ManagedObject for T {
    fn router_base(&self) -> &RouterObjectBase {
        self.base()
    }

    fn actor_executor(&self) -> Option<ActorExecutor> {
        self.actor()
    }

    async fn save_with_default_data(
        &self,
        ctx: &AwaitableContext,
        guard: &mut IoTaskGuard,
    ) -> RpcResult<()> {
        let private_data = T::PrivateData::default();
        internal_save_object(ctx, self, guard, &private_data).await
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Identity comparison of two erased objects.
pub fn same_object(
    a: &Arc<dyn ManagedObject>,
    b: &Arc<dyn ManagedObject>,
) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

fn require_task(
    ctx: &AwaitableContext,
    key: RouterKey,
) -> RpcResult<()> {
    if let Err(e) = ctx.require_task() {
        error!(key = %key, "router io must run inside a task");
        return Err(e);
    }
    Ok(())
}

/// Pulls the read-only cache under the IO slot.
pub async fn internal_pull_cache<T: RouterObject>(
    ctx: &AwaitableContext,
    object: &T,
    guard: &mut IoTaskGuard,
    private_data: &T::PrivateData,
) -> RpcResult<()> {
    let base = object.base();
    base.unset_flag(RouterObjectFlag::SCHED_REMOVE_CACHE);
    require_task(ctx, base.key())?;

    guard.take(ctx, base).await?;

    let _pulling = FlagGuard::new(base, RouterObjectFlag::PULLING_CACHE);
    object.pull_cache(ctx, private_data).await?;
    base.refresh_save_time(ctx.sys_now());
    Ok(())
}

/// Pulls the entity and upgrades the object when this process owns it.
///
/// An object that became writable while waiting for the IO slot is returned as is.
pub async fn internal_pull_object<T: RouterObject>(
    ctx: &AwaitableContext,
    object: &T,
    guard: &mut IoTaskGuard,
    private_data: &T::PrivateData,
) -> RpcResult<()> {
    let base = object.base();
    base.unset_flag(
        RouterObjectFlag::FORCE_REMOVE_OBJECT
            | RouterObjectFlag::SCHED_REMOVE_OBJECT
            | RouterObjectFlag::SCHED_REMOVE_CACHE,
    );
    require_task(ctx, base.key())?;

    guard.take(ctx, base).await?;
    if base.is_writable() {
        return Ok(());
    }

    let _pulling = FlagGuard::new(base, RouterObjectFlag::PULLING_OBJECT);
    base.unset_flag(RouterObjectFlag::CACHE_REMOVED | RouterObjectFlag::FORCE_PULL_OBJECT);

    object.pull_object(ctx, private_data).await?;
    base.refresh_save_time(ctx.sys_now());

    let owner = base.router_server_id();
    let logic_id = ctx.app().logic_id();
    if owner != 0 && owner != logic_id {
        debug!(key = %base.key(), owner, logic_id, "router object owned by another server");
        return Err(RpcError::new(ErrorCode::RouterNotWritable));
    }

    base.upgrade(ctx.sys_now());
    Ok(())
}

/// Saves the entity. Saves queued behind another one that already covered them are merged.
pub async fn internal_save_object<T: RouterObject>(
    ctx: &AwaitableContext,
    object: &T,
    guard: &mut IoTaskGuard,
    private_data: &T::PrivateData,
) -> RpcResult<()> {
    let base = object.base();
    base.unset_flag(RouterObjectFlag::SCHED_SAVE_OBJECT);
    let this_sequence = base.next_saving_sequence();
    require_task(ctx, base.key())?;

    guard.take(ctx, base).await?;
    if !base.is_writable() {
        return Err(RpcError::new(ErrorCode::RouterNotWritable));
    }
    if base.saved_sequence() >= this_sequence {
        debug!(key = %base.key(), sequence = this_sequence, "save merged into a previous one");
        return Ok(());
    }

    let _saving = FlagGuard::new(base, RouterObjectFlag::SAVING);
    let real_sequence = base.saving_sequence();
    object.save_object(ctx, private_data).await?;

    base.mark_saved(real_sequence);
    base.refresh_save_time(ctx.sys_now());
    Ok(())
}

/// Hands the entity over to `transfer_to` (0 for nobody), saves it and downgrades it.
///
/// A failed save restores the previous routing.
pub async fn remove_object<T: RouterObject>(
    ctx: &AwaitableContext,
    object: &T,
    transfer_to: u64,
    guard: &mut IoTaskGuard,
    private_data: &T::PrivateData,
) -> RpcResult<()> {
    let base = object.base();
    guard.take(ctx, base).await?;

    // Already removed or downgraded while waiting for the slot
    if !base.is_writable() {
        return Ok(());
    }

    let old_server_id = base.router_server_id();
    let old_version = base.router_server_version();
    if transfer_to != old_server_id {
        base.set_router_server(transfer_to, old_version + 1);
    }
    base.refresh_visit_time(ctx.sys_now());

    if let Err(e) = internal_save_object(ctx, object, guard, private_data).await {
        base.set_router_server(old_server_id, old_version);
        return Err(e);
    }

    base.downgrade(ctx.sys_now());
    Ok(())
}
