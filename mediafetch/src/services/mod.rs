//! Service wiring and lifecycle.

pub mod container;

pub use container::{Collaborators, ServiceContainer};
