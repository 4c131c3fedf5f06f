use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::utils::time::get_now_as_i64;

/// Second-resolution application clock.
///
/// A system clock follows the wall clock plus an adjustable offset; a manual clock only moves
/// when told to, which makes timer sweeps deterministic.
#[derive(Debug)]
pub struct AppClock {
    manual: Option<AtomicI64>,
    offset: AtomicI64,
}

impl Default for AppClock {
    fn default() -> Self {
        Self::system()
    }
}

impl AppClock {
    pub fn system() -> Self {
        Self {
            manual: None,
            offset: AtomicI64::new(0),
        }
    }

    pub fn manual(start: i64) -> Self {
        Self {
            manual: Some(AtomicI64::new(start)),
            offset: AtomicI64::new(0),
        }
    }

    /// Unix seconds.
    pub fn now(&self) -> i64 {
        let base = match &self.manual {
            Some(now) => now.load(Ordering::Acquire),
            None => get_now_as_i64(),
        };
        base + self.offset.load(Ordering::Acquire)
    }

    pub fn advance(
        &self,
        by: Duration,
    ) {
        self.offset.fetch_add(by.as_secs() as i64, Ordering::AcqRel);
    }

    pub fn set_offset(
        &self,
        offset_secs: i64,
    ) {
        self.offset.store(offset_secs, Ordering::Release);
    }

    pub fn offset(&self) -> i64 {
        self.offset.load(Ordering::Acquire)
    }
}
