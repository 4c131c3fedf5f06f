//! Process-wide runtime handle: settings, clock, task registry and the app loop.
mod app_loop;
mod clock;
mod runtime;

pub use app_loop::*;
pub use clock::*;
pub use runtime::*;

#[cfg(test)]
mod app_loop_test;
