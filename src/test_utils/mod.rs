//! Shared fixtures of the unit tests: a runtime with a manual clock, task helpers, sample
//! records and a scripted router object.
mod records;
mod router;
mod runtime;

pub use records::*;
pub use router::*;
pub use runtime::*;
