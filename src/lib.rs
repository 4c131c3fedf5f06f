//! Runtime core of a game service process.
//!
//! - [`task`]: cooperative task actions with descriptor-matched resume, kill and timeout.
//! - [`dispatcher`]: the await bridge that suspends a task on one Redis round-trip.
//! - [`db`]: hash-table records over Redis with compare-and-set versioning.
//! - [`router`]: cache/entity lifecycle of routed business objects, with timers, auto-save and
//!   graceful close.
mod app;
mod config;
pub mod constants;
mod db;
mod dispatcher;
mod errors;
pub mod proto;
mod router;
mod task;
pub mod utils;

pub use app::*;
pub use config::*;
pub use db::*;
pub use dispatcher::*;
pub use errors::*;
pub use router::*;
pub use task::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
