//! Cooperative task runtime.
//!
//! Task bodies run as tokio tasks. Between suspension points each body has a single-threaded
//! view of its own state; suspension happens only through [`TaskHandle::yield_with`], and only a
//! resume whose [`AwaitDescriptor`] matches the current wait wakes the body up.
mod actor_executor;
mod await_descriptor;
mod context;
mod fan_out;
mod task_action;
mod task_handle;
mod task_manager;

pub use actor_executor::*;
pub use await_descriptor::*;
pub use context::*;
pub use fan_out::*;
pub use task_action::*;
pub use task_handle::*;
pub use task_manager::*;

#[cfg(test)]
mod task_handle_test;
