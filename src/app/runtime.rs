use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use super::AppAction;
use super::AppClock;
use super::AppLoop;
use crate::Result;
use crate::Settings;
use crate::TaskManager;

/// Shared runtime of one game service process.
pub struct AppRuntime {
    settings: ArcSwap<Settings>,
    clock: AppClock,
    task_manager: TaskManager,
    app_loop: Arc<dyn AppLoop>,
}

impl AppRuntime {
    pub fn new(
        settings: Settings,
        app_loop: Arc<dyn AppLoop>,
    ) -> Arc<Self> {
        Self::with_clock(settings, app_loop, AppClock::system())
    }

    pub fn with_clock(
        settings: Settings,
        app_loop: Arc<dyn AppLoop>,
        clock: AppClock,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings: ArcSwap::from_pointee(settings),
            clock,
            task_manager: TaskManager::new(),
            app_loop,
        })
    }

    /// Current settings snapshot. One atomic load, safe to call on hot paths.
    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    /// Swaps in validated settings. Running operations keep the snapshot they started with.
    pub fn reload_settings(
        &self,
        settings: Settings,
    ) -> Result<()> {
        let settings = settings.validate()?;
        info!(app_id = settings.app.id, "settings reloaded");
        self.settings.store(Arc::new(settings));
        Ok(())
    }

    /// Router server id of this process.
    pub fn logic_id(&self) -> u64 {
        self.settings.load().app.id
    }

    /// Unix seconds as seen by timers and router objects.
    pub fn sys_now(&self) -> i64 {
        self.clock.now()
    }

    pub fn clock(&self) -> &AppClock {
        &self.clock
    }

    pub fn task_manager(&self) -> &TaskManager {
        &self.task_manager
    }

    pub fn push_action(
        &self,
        action: AppAction,
    ) -> Result<()> {
        self.app_loop.push_action(action)
    }
}

impl fmt::Debug for AppRuntime {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("AppRuntime")
            .field("logic_id", &self.logic_id())
            .field("now", &self.sys_now())
            .field("tasks", &self.task_manager.task_count())
            .finish()
    }
}
