//! Recently seen item ids, per source.
//!
//! Advisory only: it saves a round trip to the store for items the monitor
//! has already handled. The unique index on live delivery tasks is what
//! actually prevents duplicates.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::trace;

use crate::domain::SourceId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Item ids kept per source.
    pub capacity: usize,
    /// Entries older than this are evicted.
    pub max_age: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl DedupConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.capacity == 0 {
            return Err(crate::Error::config("dedup capacity must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SeenWindow {
    order: VecDeque<(String, Instant)>,
    ids: HashSet<String>,
}

impl SeenWindow {
    fn evict(&mut self, capacity: usize, max_age: Duration, now: Instant) {
        while let Some((id, at)) = self.order.front() {
            let too_old = now.saturating_duration_since(*at) >= max_age;
            if self.order.len() <= capacity && !too_old {
                break;
            }
            self.ids.remove(id);
            self.order.pop_front();
        }
    }
}

/// Bounded, time-evicted set of item ids per source.
#[derive(Debug)]
pub struct DedupCache {
    windows: DashMap<SourceId, SeenWindow>,
    config: DedupConfig,
}

impl DedupCache {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            windows: DashMap::new(),
            config,
        }
    }

    /// Check and insert in one step. Returns `true` if the item was already
    /// present, `false` if this call recorded it.
    pub fn seen(&self, source: &SourceId, item_id: &str) -> bool {
        let now = Instant::now();
        let mut window = self.windows.entry(source.clone()).or_default();
        window.evict(self.config.capacity, self.config.max_age, now);

        if window.ids.contains(item_id) {
            trace!(source = %source, item_id, "Item already seen");
            return true;
        }

        window.ids.insert(item_id.to_string());
        window.order.push_back((item_id.to_string(), now));
        window.evict(self.config.capacity, self.config.max_age, now);
        false
    }

    /// Whether the item is present, without recording it.
    pub fn contains(&self, source: &SourceId, item_id: &str) -> bool {
        let now = Instant::now();
        self.windows.get(source).is_some_and(|window| {
            window.order.iter().any(|(id, at)| {
                id == item_id && now.saturating_duration_since(*at) < self.config.max_age
            })
        })
    }

    /// Drop an item so the next poll treats it as new.
    pub fn forget(&self, source: &SourceId, item_id: &str) {
        if let Some(mut window) = self.windows.get_mut(source)
            && window.ids.remove(item_id)
        {
            window.order.retain(|(id, _)| id != item_id);
        }
    }

    /// Number of ids currently held for `source`.
    pub fn len(&self, source: &SourceId) -> usize {
        self.windows.get(source).map_or(0, |w| w.order.len())
    }

    /// Evict aged entries everywhere and drop empty sources. Returns the
    /// number of ids removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.windows.retain(|_, window| {
            let before = window.order.len();
            window.evict(self.config.capacity, self.config.max_age, now);
            removed += before - window.order.len();
            !window.order.is_empty()
        });
        removed
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}
