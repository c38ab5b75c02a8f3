//! Source polling and new-item detection.

pub mod dedup;
pub mod service;

pub use dedup::{DedupCache, DedupConfig};
pub use service::{ContentMonitor, MonitorConfig, PollReport, PollStatus};
