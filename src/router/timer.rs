use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;

use super::ManagedObject;

/// The two timer wheels of the manager set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerListKind {
    Default,
    /// Shorter interval, for busy objects and cache-removal follow-ups
    Fast,
}

pub(crate) struct RouterTimer {
    pub(crate) object: Weak<dyn ManagedObject>,
    pub(crate) type_id: u32,
    /// Unix seconds
    pub(crate) timeout: i64,
    pub(crate) sequence: u64,
}

/// FIFO of timers sharing one interval, hence sorted by timeout.
///
/// Entries are never removed out of order. An object that moves or detaches bumps its timer
/// sequence, and the stale entry is dropped when it expires.
#[derive(Default)]
pub(crate) struct TimerList {
    timers: Mutex<VecDeque<RouterTimer>>,
}

impl TimerList {
    pub(crate) fn push_back(
        &self,
        timer: RouterTimer,
    ) {
        self.timers.lock().push_back(timer);
    }

    /// Pops the head if it expired, i.e. `now > timeout`.
    pub(crate) fn pop_expired(
        &self,
        now: i64,
    ) -> Option<RouterTimer> {
        let mut timers = self.timers.lock();
        match timers.front() {
            Some(timer) if now > timer.timeout => timers.pop_front(),
            _ => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.timers.lock().len()
    }

    pub(crate) fn next_timeout(&self) -> Option<i64> {
        self.timers.lock().front().map(|timer| timer.timeout)
    }

    /// Objects whose live timer sits in this list.
    pub(crate) fn live_objects(&self) -> Vec<Arc<dyn ManagedObject>> {
        self.timers
            .lock()
            .iter()
            .filter_map(|timer| {
                let object = timer.object.upgrade()?;
                object
                    .router_base()
                    .check_timer_sequence(timer.sequence)
                    .then_some(object)
            })
            .collect()
    }
}
