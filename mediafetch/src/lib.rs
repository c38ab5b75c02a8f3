//! mediafetch library crate.
//!
//! Pairs source accounts with messaging recipients, watches the sources for
//! new content and delivers each item to every bound recipient exactly once.

pub mod alert;
pub mod config;
pub mod database;
pub mod delivery;
pub mod domain;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod platform;
pub mod registry;
pub mod services;

pub use error::{Error, PairingError, Result};
