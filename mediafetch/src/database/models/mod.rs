//! Database models.
//!
//! These map directly to the schema; JSON columns are kept as strings and
//! decoded on access.

pub mod binding;
pub mod delivery_task;
pub mod pairing;
pub mod source;

pub use binding::*;
pub use delivery_task::*;
pub use pairing::*;
pub use source::*;
