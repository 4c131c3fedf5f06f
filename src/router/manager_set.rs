//! Registry of router managers plus the timer wheels and background jobs that expire, save and
//! downgrade their objects.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;
use parking_lot::RwLock;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::same_object;
use super::ManagedObject;
use super::RouterManagerBase;
use super::RouterObjectFlag;
use super::RouterTimer;
use super::TaskActionAutoSaveObjects;
use super::TaskActionRouterCloseManagerSet;
use super::TimerList;
use super::TimerListKind;
use crate::constants::MAX_ROUTER_MANAGER_TYPES;
use crate::constants::ROUTER_STAT_PERIOD_SECS;
use crate::async_then_start_task;
use crate::run_task_action;
use crate::AppRuntime;
use crate::Result;
use crate::RouterConfig;
use crate::SystemError;
use crate::TaskHandle;
use crate::TaskOptions;

/// Background job queued by the timers or by owners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoSaveActionKind {
    Save,
    RemoveObject,
    RemoveCache,
}

impl AutoSaveActionKind {
    pub fn name(self) -> &'static str {
        match self {
            AutoSaveActionKind::Save => "save",
            AutoSaveActionKind::RemoveObject => "remove object",
            AutoSaveActionKind::RemoveCache => "remove cache",
        }
    }
}

#[derive(Clone)]
pub struct PendingAction {
    pub(crate) kind: AutoSaveActionKind,
    pub(crate) type_id: u32,
    pub(crate) object: Arc<dyn ManagedObject>,
}

impl PendingAction {
    pub fn kind(&self) -> AutoSaveActionKind {
        self.kind
    }

    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    pub fn object(&self) -> &Arc<dyn ManagedObject> {
        &self.object
    }
}

impl fmt::Debug for PendingAction {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("PendingAction")
            .field("kind", &self.kind)
            .field("key", &self.object.router_base().key())
            .finish()
    }
}

fn same_manager(
    a: &Arc<dyn RouterManagerBase>,
    b: &Arc<dyn RouterManagerBase>,
) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

pub struct RouterManagerSet {
    app: Arc<AppRuntime>,
    weak_self: Weak<Self>,
    default_timers: TimerList,
    fast_timers: TimerList,
    last_proc_time: AtomicI64,
    managers: RwLock<Vec<Option<Arc<dyn RouterManagerBase>>>>,
    pending_actions: Mutex<VecDeque<PendingAction>>,
    auto_save_task: Mutex<Option<TaskHandle>>,
    closing_task: Mutex<Option<TaskHandle>>,
    closing_fallback_task: Mutex<Option<TaskHandle>>,
    closing: AtomicBool,
    closed: AtomicBool,
    pre_closing: AtomicBool,
}

impl RouterManagerSet {
    pub fn new(app: Arc<AppRuntime>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            app,
            weak_self: weak_self.clone(),
            default_timers: TimerList::default(),
            fast_timers: TimerList::default(),
            last_proc_time: AtomicI64::new(0),
            managers: RwLock::new(vec![None; MAX_ROUTER_MANAGER_TYPES]),
            pending_actions: Mutex::new(VecDeque::new()),
            auto_save_task: Mutex::new(None),
            closing_task: Mutex::new(None),
            closing_fallback_task: Mutex::new(None),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pre_closing: AtomicBool::new(false),
        })
    }

    pub fn app(&self) -> &Arc<AppRuntime> {
        &self.app
    }

    pub fn register_manager(
        &self,
        manager: Arc<dyn RouterManagerBase>,
    ) -> Result<()> {
        let type_id = manager.router_type();
        let slot = type_id as usize;
        if slot >= MAX_ROUTER_MANAGER_TYPES {
            return Err(SystemError::ManagerTypeOutOfRange(type_id).into());
        }

        {
            let mut managers = self.managers.write();
            if managers[slot].is_some() {
                return Err(SystemError::ManagerAlreadyRegistered(type_id).into());
            }
            managers[slot] = Some(manager.clone());
        }

        if self.is_closing() {
            manager.on_stop();
        }
        info!(manager = manager.name(), type_id, "router manager registered");
        Ok(())
    }

    pub fn manager(
        &self,
        type_id: u32,
    ) -> Option<Arc<dyn RouterManagerBase>> {
        self.managers.read().get(type_id as usize).cloned().flatten()
    }

    /// Total cached objects over all managers.
    pub fn size(&self) -> usize {
        self.managers.read().iter().flatten().map(|m| m.size()).sum()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Makes every `tick` run, even twice within one second.
    pub fn set_pre_closing(&self) {
        self.pre_closing.store(true, Ordering::Release);
    }

    pub fn pending_action_count(&self) -> usize {
        self.pending_actions.lock().len()
    }

    /// Snapshot of the queued background jobs, oldest first.
    pub fn pending_actions(&self) -> Vec<PendingAction> {
        self.pending_actions.lock().iter().cloned().collect()
    }

    pub fn timer_count(
        &self,
        kind: TimerListKind,
    ) -> usize {
        self.timer_list(kind).len()
    }

    pub fn auto_save_task(&self) -> Option<TaskHandle> {
        self.auto_save_task.lock().clone()
    }

    pub fn closing_task(&self) -> Option<TaskHandle> {
        self.closing_task.lock().clone()
    }

    /// Best-effort pass started when the closing task was interrupted.
    pub fn closing_fallback_task(&self) -> Option<TaskHandle> {
        self.closing_fallback_task.lock().clone()
    }

    /// Periodic driver, called once per app tick.
    pub fn tick(&self) {
        let now = self.app.sys_now();
        let last = self.last_proc_time.swap(now, Ordering::AcqRel);
        if !self.is_closing() && !self.pre_closing.load(Ordering::Acquire) && last == now {
            return;
        }

        if last.div_euclid(ROUTER_STAT_PERIOD_SECS) != now.div_euclid(ROUTER_STAT_PERIOD_SECS) {
            self.log_stats();
        }

        let settings = self.app.settings();
        if !self.is_closing_task_running() {
            self.tick_timer(TimerListKind::Default, &settings.router, now);
            self.tick_timer(TimerListKind::Fast, &settings.router, now);
        }

        if self.pending_action_count() > 0
            && !self.is_closed()
            && !self.is_closing()
            && !self.is_auto_save_task_running()
            && !self.is_closing_task_running()
        {
            self.start_auto_save_task();
        }

        if self.is_closing() && !self.is_closing_work_pending() && !self.closed.swap(true, Ordering::AcqRel) {
            info!("router manager set closed");
        }
    }

    /// Handles every timer of `kind` that expired strictly before `now`.
    pub fn tick_timer(
        &self,
        kind: TimerListKind,
        router: &RouterConfig,
        now: i64,
    ) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let list = self.timer_list(kind);
        while let Some(timer) = list.pop_expired(now) {
            let Some(object) = timer.object.upgrade() else {
                continue;
            };
            if !object.router_base().check_timer_sequence(timer.sequence) {
                continue;
            }

            let actor = object.actor_executor();
            let set = this.clone();
            let snapshot = router.clone();
            let handled = object.clone();
            let (type_id, sequence) = (timer.type_id, timer.sequence);
            let on_timer = move || set.on_timer(kind, type_id, sequence, handled, &snapshot, now);

            match actor {
                Some(actor) => {
                    if let Err(e) = actor.post(on_timer) {
                        warn!(key = %object.router_base().key(), error = %e, "post router timer failed");
                        if let Some(manager) = self.manager(type_id) {
                            self.insert_timer_at(&manager, &object, true, router_interval(router, true), now);
                        }
                    }
                }
                None => on_timer(),
            }
        }
    }

    fn on_timer(
        &self,
        kind: TimerListKind,
        type_id: u32,
        sequence: u64,
        object: Arc<dyn ManagedObject>,
        router: &RouterConfig,
        now: i64,
    ) {
        let base = object.router_base();
        if !base.check_timer_sequence(sequence) {
            return;
        }
        let manager = match self.manager(type_id) {
            Some(manager) => manager,
            None => {
                base.check_and_remove_timer_ref(kind, sequence);
                return;
            }
        };
        if !manager
            .base_cache(&base.key())
            .is_some_and(|current| same_object(&current, &object))
        {
            base.check_and_remove_timer_ref(kind, sequence);
            return;
        }

        // A fast-list timer only re-arms on the fast list
        let mut fast = kind == TimerListKind::Fast;
        if base.is_io_running() {
            fast = true;
        } else if base.check_flag(RouterObjectFlag::IS_OBJECT) {
            if base.last_visit_time() + router.object_free_timeout < now
                || base.check_flag(RouterObjectFlag::FORCE_REMOVE_OBJECT)
            {
                self.push_pending_action(AutoSaveActionKind::RemoveObject, type_id, object.clone());
                base.set_flag(RouterObjectFlag::SCHED_REMOVE_OBJECT);
                base.unset_flag(RouterObjectFlag::FORCE_REMOVE_OBJECT);
            } else if base.last_save_time() + router.object_save_interval < now
                || base.check_flag(RouterObjectFlag::FORCE_SAVE_OBJECT)
            {
                self.push_pending_action(AutoSaveActionKind::Save, type_id, object.clone());
                base.refresh_save_time(now);
                base.set_flag(RouterObjectFlag::SCHED_SAVE_OBJECT);
                base.unset_flag(RouterObjectFlag::FORCE_SAVE_OBJECT);
            }
        } else if base.last_visit_time() + router.cache_free_timeout < now {
            self.push_pending_action(AutoSaveActionKind::RemoveCache, type_id, object.clone());
            base.set_flag(RouterObjectFlag::SCHED_REMOVE_CACHE);
            fast = true;
        }

        base.check_and_remove_timer_ref(kind, sequence);
        self.insert_timer_at(&manager, &object, fast, router_interval(router, fast), now);
    }

    /// Arms a timer for `object` on the default or the fast list. Refused while closing and for a
    /// manager that is not the one registered under its type id.
    pub fn insert_timer(
        &self,
        manager: &Arc<dyn RouterManagerBase>,
        object: &Arc<dyn ManagedObject>,
        fast: bool,
    ) -> bool {
        let settings = self.app.settings();
        self.insert_timer_at(
            manager,
            object,
            fast,
            router_interval(&settings.router, fast),
            self.app.sys_now(),
        )
    }

    fn insert_timer_at(
        &self,
        manager: &Arc<dyn RouterManagerBase>,
        object: &Arc<dyn ManagedObject>,
        fast: bool,
        interval: i64,
        now: i64,
    ) -> bool {
        if self.is_closing() {
            return false;
        }
        let type_id = manager.router_type();
        if !self
            .manager(type_id)
            .is_some_and(|registered| same_manager(&registered, manager))
        {
            debug!(type_id, "timer refused for unregistered manager");
            return false;
        }

        let kind = if fast { TimerListKind::Fast } else { TimerListKind::Default };
        let base = object.router_base();
        let sequence = base.alloc_timer_sequence();
        self.timer_list(kind).push_back(RouterTimer {
            object: Arc::downgrade(object),
            type_id,
            timeout: now + interval,
            sequence,
        });
        base.reset_timer_ref(kind, sequence);
        true
    }

    /// Queues a save of a writable object. Returns false when the object is not writable.
    pub fn add_save_schedule(
        &self,
        object: &Arc<dyn ManagedObject>,
    ) -> bool {
        let base = object.router_base();
        if !base.is_writable() {
            return false;
        }
        if base.check_flag(RouterObjectFlag::SCHED_SAVE_OBJECT) {
            return true;
        }
        base.set_flag(RouterObjectFlag::SCHED_SAVE_OBJECT);
        self.push_pending_action(AutoSaveActionKind::Save, base.key().type_id, object.clone());
        true
    }

    /// Queues a downgrade of a writable object, superseding a queued save.
    pub fn add_downgrade_schedule(
        &self,
        object: &Arc<dyn ManagedObject>,
    ) -> bool {
        let base = object.router_base();
        if !base.is_writable() {
            return false;
        }
        base.unset_flag(RouterObjectFlag::SCHED_SAVE_OBJECT);
        if base.check_flag(RouterObjectFlag::SCHED_REMOVE_OBJECT) {
            return true;
        }
        base.set_flag(RouterObjectFlag::SCHED_REMOVE_OBJECT);
        self.push_pending_action(AutoSaveActionKind::RemoveObject, base.key().type_id, object.clone());
        true
    }

    /// Forces a save at the next fast timer round.
    pub fn mark_fast_save(
        &self,
        manager: &Arc<dyn RouterManagerBase>,
        object: &Arc<dyn ManagedObject>,
    ) -> bool {
        let base = object.router_base();
        base.set_flag(RouterObjectFlag::FORCE_SAVE_OBJECT);
        if base.timer_list() == Some(TimerListKind::Fast) {
            return true;
        }
        self.insert_timer(manager, object, true)
    }

    /// Starts the graceful shutdown: managers refuse new entities and every writable object with
    /// a live timer is saved and downgraded by a closing task.
    pub fn stop(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut seen = HashSet::new();
        let pending: VecDeque<Arc<dyn ManagedObject>> = self
            .default_timers
            .live_objects()
            .into_iter()
            .chain(self.fast_timers.live_objects())
            .filter(|object| object.router_base().is_writable())
            .filter(|object| seen.insert(object.router_base().key()))
            .collect();
        info!(objects = pending.len(), "router manager set stopping");

        for manager in self.managers.read().iter().flatten() {
            manager.on_stop();
        }

        let settings = self.app.settings();
        let options = TaskOptions::with_timeout(settings.task.nomsg_timeout()).name("router close manager set");
        let task = self.app.task_manager().create_task(
            TaskActionRouterCloseManagerSet::new(self.weak_self.clone(), pending),
            options,
        );
        *self.closing_task.lock() = Some(task.clone());

        match self.auto_save_task().filter(|t| !t.is_exiting()) {
            Some(auto_save) => {
                debug!(auto_save_task = auto_save.id(), "closing task chained after auto save");
                async_then_start_task(&self.app, &auto_save, task);
            }
            None => {
                if let Err(e) = run_task_action(&self.app, &task) {
                    error!(error = %e, "start closing task failed");
                    self.closing_task.lock().take();
                }
            }
        }
    }

    /// Kills the closing task with a timeout. Its fallback pass still saves what is left, and the
    /// set reports closed only after that pass finished, so keep ticking.
    pub fn force_close(&self) {
        if let Some(task) = self.closing_task() {
            if task.timeout_kill() {
                warn!(task_id = task.id(), "router closing task force killed");
            }
        }
    }

    pub(crate) fn pop_pending_action(&self) -> Option<PendingAction> {
        self.pending_actions.lock().pop_front()
    }

    pub(crate) fn clear_auto_save_task(
        &self,
        task_id: u64,
    ) {
        let mut task = self.auto_save_task.lock();
        if task.as_ref().is_some_and(|t| t.id() == task_id) {
            *task = None;
        }
    }

    pub(crate) fn set_closing_fallback_task(
        &self,
        task: TaskHandle,
    ) {
        *self.closing_fallback_task.lock() = Some(task);
    }

    pub(crate) fn clear_closing_task(
        &self,
        task_id: u64,
    ) {
        let mut task = self.closing_task.lock();
        if task.as_ref().is_some_and(|t| t.id() == task_id) {
            *task = None;
        }
    }

    fn push_pending_action(
        &self,
        kind: AutoSaveActionKind,
        type_id: u32,
        object: Arc<dyn ManagedObject>,
    ) {
        debug!(kind = kind.name(), key = %object.router_base().key(), "router action queued");
        self.pending_actions.lock().push_back(PendingAction { kind, type_id, object });
    }

    fn start_auto_save_task(&self) {
        let settings = self.app.settings();
        let options = TaskOptions::with_timeout(settings.task.nomsg_timeout()).name("router auto save");
        let task = self
            .app
            .task_manager()
            .create_task(TaskActionAutoSaveObjects::new(self.weak_self.clone()), options);
        *self.auto_save_task.lock() = Some(task.clone());
        if let Err(e) = run_task_action(&self.app, &task) {
            error!(error = %e, "start auto save task failed");
            self.clear_auto_save_task(task.id());
        }
    }

    fn is_auto_save_task_running(&self) -> bool {
        self.auto_save_task.lock().as_ref().is_some_and(|t| !t.is_exiting())
    }

    fn is_closing_task_running(&self) -> bool {
        self.closing_task.lock().as_ref().is_some_and(|t| !t.is_exiting())
    }

    /// A killed closing task still runs its hooks, which may start the fallback pass.
    fn is_closing_work_pending(&self) -> bool {
        self.closing_task.lock().as_ref().is_some_and(|t| !t.is_finished())
            || self
                .closing_fallback_task
                .lock()
                .as_ref()
                .is_some_and(|t| !t.is_finished())
    }

    fn timer_list(
        &self,
        kind: TimerListKind,
    ) -> &TimerList {
        match kind {
            TimerListKind::Default => &self.default_timers,
            TimerListKind::Fast => &self.fast_timers,
        }
    }

    fn log_stats(&self) {
        info!(
            default_timers = self.default_timers.len(),
            next_default_timeout = ?self.default_timers.next_timeout(),
            fast_timers = self.fast_timers.len(),
            pending_actions = self.pending_action_count(),
            "router timer stats"
        );
        for manager in self.managers.read().iter().flatten() {
            info!(manager = manager.name(), type_id = manager.router_type(), caches = manager.size(), "router cache stats");
        }
    }
}

fn router_interval(
    router: &RouterConfig,
    fast: bool,
) -> i64 {
    if fast {
        router.fast_timer_interval
    } else {
        router.default_timer_interval
    }
}

impl fmt::Debug for RouterManagerSet {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("RouterManagerSet")
            .field("size", &self.size())
            .field("default_timers", &self.default_timers.len())
            .field("fast_timers", &self.fast_timers.len())
            .field("pending_actions", &self.pending_action_count())
            .field("closing", &self.is_closing())
            .field("closed", &self.is_closed())
            .finish()
    }
}
