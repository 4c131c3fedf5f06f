//! Router objects: process-local caches of game entities with an optional writable ownership.
//!
//! A [`RouterManager`] maps [`RouterKey`]s of one type to objects. Reads go through
//! `mutable_cache`, ownership through `mutable_object`; both serialize IO per object with an
//! [`IoTaskGuard`]. The [`RouterManagerSet`] runs the timers that save, downgrade and evict
//! idle objects, and drives the graceful shutdown.
mod auto_save;
mod close_manager_set;
mod io_guard;
mod key;
mod manager;
mod manager_set;
mod object;
mod timer;

pub use auto_save::*;
pub use close_manager_set::*;
pub use io_guard::*;
pub use key::*;
pub use manager::*;
pub use manager_set::*;
pub use object::*;
pub use timer::*;

#[cfg(test)]
mod manager_test;
