//! In-memory deduplication of entity identifiers.
//!
//! The [`Deduplicator`] tracks which token ids have already been admitted to
//! the pipeline. An admitted id is never admitted again until the set is
//! evicted.
//!
//! # Eviction
//!
//! Eviction is coarse: once the set grows past its high-water mark the whole
//! set is cleared. A duplicate arriving right after a mass eviction can be
//! admitted a second time; that window is accepted in exchange for bounded
//! memory and O(1) bookkeeping.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

/// Default set size past which the cache is cleared.
pub const DEFAULT_HIGH_WATER_MARK: usize = 5_000;

/// Tracks admitted entity ids.
///
/// Thread-safe: share via `Arc<Deduplicator>`. `admit` performs the
/// membership check and the insert under one lock acquisition.
pub struct Deduplicator {
    /// id -> insertion time
    seen: Mutex<HashMap<String, Instant>>,
    high_water_mark: usize,
}

impl Deduplicator {
    pub fn new(high_water_mark: usize) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            high_water_mark,
        }
    }

    /// Admit an id into the pipeline.
    ///
    /// Returns `true` the first time an id is seen in the current eviction
    /// epoch and `false` for every repeat.
    pub fn admit(&self, id: &str) -> bool {
        let mut seen = self.seen.lock();
        if seen.contains_key(id) {
            debug!(id = %id, "Duplicate id rejected");
            return false;
        }
        seen.insert(id.to_string(), Instant::now());
        true
    }

    /// Check membership without admitting.
    pub fn contains(&self, id: &str) -> bool {
        self.seen.lock().contains_key(id)
    }

    /// Clear the whole set if it has grown past the high-water mark.
    ///
    /// Returns the number of ids dropped (zero when under the mark).
    pub fn evict_if_over_capacity(&self) -> usize {
        let mut seen = self.seen.lock();
        if seen.len() <= self.high_water_mark {
            return 0;
        }

        let evicted = seen.len();
        let oldest_age_secs = seen
            .values()
            .min()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0);
        seen.clear();

        info!(
            evicted,
            high_water_mark = self.high_water_mark,
            oldest_age_secs,
            "Dedup cache evicted"
        );
        evicted
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            tracked_ids: self.len(),
            high_water_mark: self.high_water_mark,
        }
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_HIGH_WATER_MARK)
    }
}

/// Snapshot of the dedup cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub tracked_ids: usize,
    pub high_water_mark: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_admit_once() {
        let dedup = Deduplicator::new(10);

        assert!(dedup.admit("Mint111"));
        assert!(!dedup.admit("Mint111"));
        assert!(dedup.admit("Mint222"));
        assert!(dedup.contains("Mint111"));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_no_eviction_under_mark() {
        let dedup = Deduplicator::new(3);
        dedup.admit("a");
        dedup.admit("b");
        dedup.admit("c");

        assert_eq!(dedup.evict_if_over_capacity(), 0);
        assert_eq!(dedup.len(), 3);
        assert!(!dedup.admit("a"));
    }

    #[test]
    fn test_eviction_clears_everything_past_mark() {
        let dedup = Deduplicator::new(2);
        dedup.admit("a");
        dedup.admit("b");
        dedup.admit("c");

        assert_eq!(dedup.evict_if_over_capacity(), 3);
        assert!(dedup.is_empty());

        // New epoch: previously seen ids are admitted again.
        assert!(dedup.admit("a"));
    }

    #[test]
    fn test_concurrent_admit_is_exactly_once() {
        let dedup = Arc::new(Deduplicator::new(1_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dedup = Arc::clone(&dedup);
                std::thread::spawn(move || dedup.admit("Mint111"))
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admitted| *admitted)
            .count();
        assert_eq!(admitted, 1);
    }

    #[test]
    fn test_stats() {
        let dedup = Deduplicator::default();
        dedup.admit("a");
        assert_eq!(
            dedup.stats(),
            DedupStats {
                tracked_ids: 1,
                high_water_mark: DEFAULT_HIGH_WATER_MARK
            }
        );
    }
}
