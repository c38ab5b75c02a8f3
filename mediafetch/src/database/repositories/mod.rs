//! Repository layer for database access.
//!
//! Each table gets an async trait plus a SQLx implementation so services can
//! be tested against the real schema or swapped for fakes.

pub mod binding;
pub mod delivery_task;
pub mod pairing;
pub mod source;

pub use binding::*;
pub use delivery_task::*;
pub use pairing::*;
pub use source::*;
