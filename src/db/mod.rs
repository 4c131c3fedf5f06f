//! Redis hash persistence: the codec, the store seam and task-level operations.
mod codec;
mod hash_table;
mod memory_store;
mod redis_store;
mod store;

pub use codec::*;
pub use hash_table::*;
pub use memory_store::*;
pub use redis_store::*;
pub use store::*;
