//! Await glue between task bodies and the IO they wait for.
//!
//! A dispatcher reserves a `(type, sequence)` wait id per outbound call. The IO runs on the app
//! loop and delivers its result back to the suspended task with the same descriptor.
mod await_options;
mod message_dispatcher;
mod redis_dispatcher;

pub use await_options::*;
pub use message_dispatcher::*;
pub use redis_dispatcher::*;
