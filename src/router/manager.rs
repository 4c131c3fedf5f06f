use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;
use tracing::error;
use tracing::info;

use super::internal_pull_cache;
use super::internal_pull_object;
use super::remove_object;
use super::FlagGuard;
use super::IoTaskGuard;
use super::ManagedObject;
use super::RouterKey;
use super::RouterManagerSet;
use super::RouterObject;
use super::RouterObjectFlag;
use crate::proto::error::ErrorCode;
use crate::utils::async_task::half_jitter;
use crate::wait;
use crate::AwaitableContext;
use crate::RpcError;
use crate::RpcResult;
use crate::SystemError;

/// Type-erased manager, as registered in the [`RouterManagerSet`].
#[async_trait]
pub trait RouterManagerBase: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Slot of this manager in the set, equal to the `type_id` of its keys.
    fn router_type(&self) -> u32;

    fn is_closing(&self) -> bool;

    /// Marks the manager closing: entity creation is refused from now on.
    fn on_stop(&self);

    /// Number of cached objects.
    fn size(&self) -> usize;

    fn base_cache(
        &self,
        key: &RouterKey,
    ) -> Option<Arc<dyn ManagedObject>>;

    /// `RemoveCache` with default private data, used by background jobs.
    async fn remove_cache_of(
        &self,
        ctx: &AwaitableContext,
        object: Arc<dyn ManagedObject>,
    ) -> RpcResult<()>;

    /// `RemoveObject` with default private data, used by background jobs.
    async fn remove_object_of(
        &self,
        ctx: &AwaitableContext,
        object: Arc<dyn ManagedObject>,
    ) -> RpcResult<()>;

    fn is_auto_mutable_object(&self) -> bool {
        false
    }

    fn is_auto_mutable_cache(&self) -> bool {
        true
    }

    fn default_router_server_id(
        &self,
        _key: &RouterKey,
    ) -> u64 {
        0
    }

    /// `(server_id, server_version)` of the online owner of `key`.
    async fn pull_online_server(
        &self,
        _ctx: &AwaitableContext,
        _key: &RouterKey,
    ) -> RpcResult<(u64, u64)> {
        Ok((0, 0))
    }
}

pub type RouterCacheFactory<T> = Arc<dyn Fn(&AwaitableContext, RouterKey) -> Arc<T> + Send + Sync>;

pub type RouterRemoveHook<T> =
    Arc<dyn Fn(&AwaitableContext, RouterKey, &Arc<T>, &<T as RouterObject>::PrivateData) + Send + Sync>;

pub type RouterPullHook<T> = Arc<dyn Fn(&AwaitableContext, &Arc<T>, &<T as RouterObject>::PrivateData) + Send + Sync>;

struct RouterHooks<T: RouterObject> {
    on_remove_cache: Option<RouterRemoveHook<T>>,
    on_cache_removed: Option<RouterRemoveHook<T>>,
    on_remove_object: Option<RouterRemoveHook<T>>,
    on_object_removed: Option<RouterRemoveHook<T>>,
    on_pull_cache: Option<RouterPullHook<T>>,
    on_pull_object: Option<RouterPullHook<T>>,
}

impl<T: RouterObject> Default for RouterHooks<T> {
    fn default() -> Self {
        Self {
            on_remove_cache: None,
            on_cache_removed: None,
            on_remove_object: None,
            on_object_removed: None,
            on_pull_cache: None,
            on_pull_object: None,
        }
    }
}

/// Codes that end a cache retry loop at once.
fn is_cache_retry_terminal(code: ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::Timeout | ErrorCode::SystemBadPackage | ErrorCode::RouterNotFound | ErrorCode::DbRecordNotFound
    )
}

/// Codes that end an entity retry loop at once.
fn is_object_retry_terminal(code: ErrorCode) -> bool {
    is_cache_retry_terminal(code)
        || matches!(code, ErrorCode::RouterNotWritable | ErrorCode::RouterBussinessVersionDeny)
}

/// Keyed cache of router objects of one type.
pub struct RouterManager<T: RouterObject> {
    name: String,
    type_id: u32,
    closing: AtomicBool,
    factory: RouterCacheFactory<T>,
    caches: RwLock<HashMap<RouterKey, Arc<T>>>,
    hooks: RwLock<RouterHooks<T>>,
    manager_set: Weak<RouterManagerSet>,
    weak_self: Weak<Self>,
}

impl<T: RouterObject> RouterManager<T> {
    /// New caches get a timer in `manager_set`. Register the manager there before use.
    pub fn new(
        manager_set: &Arc<RouterManagerSet>,
        name: impl Into<String>,
        type_id: u32,
        factory: RouterCacheFactory<T>,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak_self| Self {
            name,
            type_id,
            closing: AtomicBool::new(false),
            factory,
            caches: RwLock::new(HashMap::new()),
            hooks: RwLock::new(RouterHooks::default()),
            manager_set: Arc::downgrade(manager_set),
            weak_self: weak_self.clone(),
        })
    }

    pub fn get_cache(
        &self,
        key: &RouterKey,
    ) -> Option<Arc<T>> {
        self.caches.read().get(key).cloned()
    }

    /// The cached object, only when it is a writable entity.
    pub fn get_object(
        &self,
        key: &RouterKey,
    ) -> Option<Arc<T>> {
        self.get_cache(key).filter(|cache| cache.base().is_writable())
    }

    pub async fn mutable_cache(
        &self,
        ctx: &AwaitableContext,
        key: RouterKey,
        private_data: &T::PrivateData,
    ) -> RpcResult<Arc<T>> {
        let mut guard = IoTaskGuard::new();
        self.mutable_cache_with_guard(ctx, key, private_data, &mut guard).await
    }

    pub async fn mutable_object(
        &self,
        ctx: &AwaitableContext,
        key: RouterKey,
        private_data: &T::PrivateData,
    ) -> RpcResult<Arc<T>> {
        let mut guard = IoTaskGuard::new();
        self.mutable_object_with_guard(ctx, key, private_data, &mut guard).await
    }

    pub async fn remove_cache(
        &self,
        ctx: &AwaitableContext,
        key: RouterKey,
        cache: Option<&Arc<T>>,
        private_data: &T::PrivateData,
    ) -> RpcResult<()> {
        let mut guard = IoTaskGuard::new();
        self.remove_cache_with_guard(ctx, key, cache, private_data, &mut guard)
            .await
    }

    pub async fn remove_object(
        &self,
        ctx: &AwaitableContext,
        key: RouterKey,
        cache: Option<&Arc<T>>,
        private_data: &T::PrivateData,
    ) -> RpcResult<()> {
        let mut guard = IoTaskGuard::new();
        self.remove_object_with_guard(ctx, key, cache, private_data, &mut guard)
            .await
    }

    /// Returns `cache` while it is still managed, otherwise fetches a fresh one.
    pub async fn renew_cache(
        &self,
        ctx: &AwaitableContext,
        key: RouterKey,
        cache: Option<Arc<T>>,
        private_data: &T::PrivateData,
    ) -> RpcResult<Arc<T>> {
        if let Some(cache) = cache {
            if !cache.base().check_flag(RouterObjectFlag::CACHE_REMOVED) {
                return Ok(cache);
            }
        }
        self.mutable_cache(ctx, key, private_data).await
    }

    pub async fn mutable_cache_with_guard(
        &self,
        ctx: &AwaitableContext,
        key: RouterKey,
        private_data: &T::PrivateData,
        guard: &mut IoTaskGuard,
    ) -> RpcResult<Arc<T>> {
        let router = ctx.settings().router.clone();
        for _ in 0..router.retry_max_ttl() {
            let cache = self.ensure_cache(ctx, key);
            let base = cache.base();

            // Another task may have finished the pull while we waited
            guard.take(ctx, base).await?;
            if base.is_cache_available(ctx) {
                base.unset_flag(RouterObjectFlag::SCHED_REMOVE_CACHE);
                return Ok(cache);
            }

            if let Err(e) = internal_pull_cache(ctx, cache.as_ref(), guard, private_data).await {
                self.erase_cache(&cache);
                info!(manager = %self.name, key = %key, error = %e, "pull cache failed");
                if is_cache_retry_terminal(e.code()) {
                    debug!(manager = %self.name, key = %key, code = ?e.code(), "cache retry aborted");
                    return Err(e);
                }
                if e.is(ErrorCode::RouterEagain) {
                    wait(ctx, half_jitter(router.cache_retry_interval())).await?;
                }
                continue;
            }

            self.invoke_pull_cache(ctx, &cache, private_data);
            return Ok(cache);
        }

        error!(manager = %self.name, key = %key, ttl = router.retry_max_ttl(), "mutable cache retry exhausted");
        Err(RpcError::new(ErrorCode::RouterTtlExtend))
    }

    pub async fn mutable_object_with_guard(
        &self,
        ctx: &AwaitableContext,
        key: RouterKey,
        private_data: &T::PrivateData,
        guard: &mut IoTaskGuard,
    ) -> RpcResult<Arc<T>> {
        let router = ctx.settings().router.clone();
        for _ in 0..router.retry_max_ttl() {
            let cache = self.ensure_cache(ctx, key);
            let base = cache.base();

            guard.take(ctx, base).await?;
            if base.is_object_available() {
                base.unset_flag(
                    RouterObjectFlag::FORCE_REMOVE_OBJECT
                        | RouterObjectFlag::SCHED_REMOVE_OBJECT
                        | RouterObjectFlag::SCHED_REMOVE_CACHE,
                );
                return Ok(cache);
            }

            if self.is_closing() {
                debug!(manager = %self.name, key = %key, "entity refused while closing");
                return Err(RpcError::new(ErrorCode::RouterClosing));
            }

            if let Err(e) = internal_pull_object(ctx, cache.as_ref(), guard, private_data).await {
                self.erase_cache(&cache);
                info!(manager = %self.name, key = %key, error = %e, "pull object failed");
                if is_object_retry_terminal(e.code()) {
                    debug!(manager = %self.name, key = %key, code = ?e.code(), "object retry aborted");
                    return Err(e);
                }
                if e.is(ErrorCode::RouterEagain) {
                    wait(ctx, half_jitter(router.object_retry_interval())).await?;
                }
                continue;
            }

            // Removed while pulling, start over
            if !base.check_flag(RouterObjectFlag::CACHE_REMOVED) {
                self.invoke_pull_object(ctx, &cache, private_data);
                return Ok(cache);
            }
        }

        error!(manager = %self.name, key = %key, ttl = router.retry_max_ttl(), "mutable object retry exhausted");
        Err(RpcError::new(ErrorCode::RouterTtlExtend))
    }

    /// Drops the cache of `key`. When `cache` is given the manager must still hold that very
    /// instance. A writable entity is removed first.
    pub async fn remove_cache_with_guard(
        &self,
        ctx: &AwaitableContext,
        key: RouterKey,
        cache: Option<&Arc<T>>,
        private_data: &T::PrivateData,
        guard: &mut IoTaskGuard,
    ) -> RpcResult<()> {
        let lookup = cache.map(|c| c.base().key()).unwrap_or(key);
        let current = self
            .get_cache(&lookup)
            .ok_or_else(|| RpcError::new(ErrorCode::RouterNotFound))?;
        if cache.is_some_and(|c| !Arc::ptr_eq(c, &current)) {
            return Err(RpcError::new(ErrorCode::RouterNotFound));
        }

        let base = current.base();
        if base.is_writable() {
            self.remove_object_with_guard(ctx, key, Some(&current), private_data, guard)
                .await?;
        }

        guard.take(ctx, base).await?;
        let _removing = FlagGuard::new(base, RouterObjectFlag::REMOVING_CACHE);

        let trigger = !base.check_flag(RouterObjectFlag::CACHE_REMOVED);
        if trigger {
            self.invoke_remove_hook(ctx, key, &current, private_data, |hooks| hooks.on_remove_cache.clone());
            base.set_flag(RouterObjectFlag::CACHE_REMOVED);
        }

        self.erase_cache(&current);

        if trigger {
            self.invoke_remove_hook(ctx, key, &current, private_data, |hooks| hooks.on_cache_removed.clone());
        }
        debug!(manager = %self.name, key = %key, "cache removed");
        Ok(())
    }

    /// Saves and downgrades the entity of `key` (or `cache`), releasing ownership.
    pub async fn remove_object_with_guard(
        &self,
        ctx: &AwaitableContext,
        key: RouterKey,
        cache: Option<&Arc<T>>,
        private_data: &T::PrivateData,
        guard: &mut IoTaskGuard,
    ) -> RpcResult<()> {
        let current = match cache {
            Some(cache) => cache.clone(),
            None => self
                .get_cache(&key)
                .ok_or_else(|| RpcError::new(ErrorCode::RouterNotFound))?,
        };

        let base = current.base();
        let _removing = FlagGuard::new(base, RouterObjectFlag::REMOVING_OBJECT);
        guard.take(ctx, base).await?;

        self.invoke_remove_hook(ctx, key, &current, private_data, |hooks| hooks.on_remove_object.clone());
        remove_object(ctx, current.as_ref(), 0, guard, private_data).await?;
        self.invoke_remove_hook(ctx, key, &current, private_data, |hooks| hooks.on_object_removed.clone());
        Ok(())
    }

    pub fn set_on_remove_cache(
        &self,
        hook: RouterRemoveHook<T>,
    ) {
        self.hooks.write().on_remove_cache = Some(hook);
    }

    pub fn set_on_cache_removed(
        &self,
        hook: RouterRemoveHook<T>,
    ) {
        self.hooks.write().on_cache_removed = Some(hook);
    }

    pub fn set_on_remove_object(
        &self,
        hook: RouterRemoveHook<T>,
    ) {
        self.hooks.write().on_remove_object = Some(hook);
    }

    pub fn set_on_object_removed(
        &self,
        hook: RouterRemoveHook<T>,
    ) {
        self.hooks.write().on_object_removed = Some(hook);
    }

    pub fn set_on_pull_cache(
        &self,
        hook: RouterPullHook<T>,
    ) {
        self.hooks.write().on_pull_cache = Some(hook);
    }

    pub fn set_on_pull_object(
        &self,
        hook: RouterPullHook<T>,
    ) {
        self.hooks.write().on_pull_object = Some(hook);
    }

    fn invoke_remove_hook(
        &self,
        ctx: &AwaitableContext,
        key: RouterKey,
        object: &Arc<T>,
        private_data: &T::PrivateData,
        select: impl FnOnce(&RouterHooks<T>) -> Option<RouterRemoveHook<T>>,
    ) {
        let hook = select(&self.hooks.read());
        if let Some(hook) = hook {
            hook(ctx, key, object, private_data);
        }
    }

    fn invoke_pull_cache(
        &self,
        ctx: &AwaitableContext,
        object: &Arc<T>,
        private_data: &T::PrivateData,
    ) {
        let hook = self.hooks.read().on_pull_cache.clone();
        if let Some(hook) = hook {
            hook(ctx, object, private_data);
        }
    }

    fn invoke_pull_object(
        &self,
        ctx: &AwaitableContext,
        object: &Arc<T>,
        private_data: &T::PrivateData,
    ) {
        let hook = self.hooks.read().on_pull_object.clone();
        if let Some(hook) = hook {
            hook(ctx, object, private_data);
        }
    }

    /// Returns the cache of `key`, creating it if needed. A factory result that lost the race
    /// against another task is discarded.
    fn ensure_cache(
        &self,
        ctx: &AwaitableContext,
        key: RouterKey,
    ) -> Arc<T> {
        if let Some(cache) = self.get_cache(&key) {
            return cache;
        }

        let created = (self.factory)(ctx, key);
        let (cache, inserted) = {
            let mut caches = self.caches.write();
            match caches.get(&key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    caches.insert(key, created.clone());
                    (created, true)
                }
            }
        };

        if inserted {
            if let (Some(set), Some(manager)) = (self.manager_set.upgrade(), self.weak_self.upgrade()) {
                let manager: Arc<dyn RouterManagerBase> = manager;
                let object: Arc<dyn ManagedObject> = cache.clone();
                set.insert_timer(&manager, &object, false);
            }
        }
        cache
    }

    /// Deletes `cache` from the map if the map still holds that very instance.
    fn erase_cache(
        &self,
        cache: &Arc<T>,
    ) -> bool {
        let key = cache.base().key();
        let mut caches = self.caches.write();
        if caches.get(&key).is_some_and(|current| Arc::ptr_eq(current, cache)) {
            cache.base().unset_timer_ref();
            caches.remove(&key);
            return true;
        }
        false
    }

    fn downcast(
        &self,
        object: Arc<dyn ManagedObject>,
    ) -> RpcResult<Arc<T>> {
        object.into_any().downcast::<T>().map_err(|_| {
            RpcError::with_source(
                ErrorCode::System,
                SystemError::RouterObjectTypeMismatch {
                    manager: self.name.clone(),
                },
            )
        })
    }
}

#[async_trait]
impl<T: RouterObject> RouterManagerBase for RouterManager<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn router_type(&self) -> u32 {
        self.type_id
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn on_stop(&self) {
        self.closing.store(true, Ordering::Release);
        // The closing task owns every save from here on, armed timers must not queue more work
        for cache in self.caches.read().values() {
            cache.base().unset_timer_ref();
        }
    }

    fn size(&self) -> usize {
        self.caches.read().len()
    }

    fn base_cache(
        &self,
        key: &RouterKey,
    ) -> Option<Arc<dyn ManagedObject>> {
        self.get_cache(key).map(|cache| cache as Arc<dyn ManagedObject>)
    }

    async fn remove_cache_of(
        &self,
        ctx: &AwaitableContext,
        object: Arc<dyn ManagedObject>,
    ) -> RpcResult<()> {
        let object = self.downcast(object)?;
        let key = object.base().key();
        let private_data = T::PrivateData::default();
        self.remove_cache(ctx, key, Some(&object), &private_data).await
    }

    async fn remove_object_of(
        &self,
        ctx: &AwaitableContext,
        object: Arc<dyn ManagedObject>,
    ) -> RpcResult<()> {
        let object = self.downcast(object)?;
        let key = object.base().key();
        let private_data = T::PrivateData::default();
        self.remove_object(ctx, key, Some(&object), &private_data).await
    }
}

impl<T: RouterObject> fmt::Debug for RouterManager<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("RouterManager")
            .field("name", &self.name)
            .field("type_id", &self.type_id)
            .field("closing", &self.is_closing())
            .field("size", &self.size())
            .finish()
    }
}
