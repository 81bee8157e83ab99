//! Bounded set of entities currently under analysis.
//!
//! [`AnalyzingSet::try_begin`] is the concurrency ceiling: it hands out at
//! most `capacity` [`AnalysisPermit`]s at a time and never two for the same
//! id. Dropping a permit frees its slot.

use super::cancel::{CancelReason, CancellationToken};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Why a slot could not be taken.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlotError {
    #[error("analysis capacity reached ({capacity} in flight)")]
    Full { capacity: usize },

    #[error("entity is already being analyzed")]
    AlreadyAnalyzing,
}

/// Entity id -> cancellation token of its running analysis.
pub struct AnalyzingSet {
    running: Mutex<HashMap<String, CancellationToken>>,
    capacity: usize,
}

impl AnalyzingSet {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            running: Mutex::new(HashMap::new()),
            capacity,
        })
    }

    /// Claim a slot for `id`. Check and insert happen under one lock.
    pub fn try_begin(self: &Arc<Self>, id: &str) -> Result<AnalysisPermit, SlotError> {
        let mut running = self.running.lock();

        if running.contains_key(id) {
            return Err(SlotError::AlreadyAnalyzing);
        }
        if running.len() >= self.capacity {
            return Err(SlotError::Full {
                capacity: self.capacity,
            });
        }

        let token = CancellationToken::new();
        running.insert(id.to_string(), token.clone());

        Ok(AnalysisPermit {
            set: Arc::clone(self),
            id: id.to_string(),
            token,
        })
    }

    /// Cancel the running analysis of `id`. Returns `false` if none is running
    /// or it was already cancelled.
    pub fn cancel(&self, id: &str, reason: CancelReason) -> bool {
        let token = self.running.lock().get(id).cloned();
        match token {
            Some(token) => token.cancel(reason),
            None => false,
        }
    }

    /// Cancel every running analysis.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let tokens: Vec<CancellationToken> = self.running.lock().values().cloned().collect();
        let cancelled = tokens.iter().filter(|t| t.cancel(reason)).count();
        if cancelled > 0 {
            info!(cancelled, reason = %reason, "Cancelled running analyses");
        }
        cancelled
    }

    pub fn contains(&self, id: &str) -> bool {
        self.running.lock().contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.running.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.running.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn release(&self, id: &str) {
        self.running.lock().remove(id);
    }
}

/// A claimed analysis slot. Frees the slot on drop.
#[derive(Debug)]
pub struct AnalysisPermit {
    set: Arc<AnalyzingSet>,
    id: String,
    token: CancellationToken,
}

impl AnalysisPermit {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for AnalysisPermit {
    fn drop(&mut self) {
        self.set.release(&self.id);
    }
}

impl std::fmt::Debug for AnalyzingSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyzingSet")
            .field("running", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_is_enforced() {
        let set = AnalyzingSet::new(2);
        let a = set.try_begin("a").unwrap();
        let _b = set.try_begin("b").unwrap();

        assert_eq!(set.try_begin("c").unwrap_err(), SlotError::Full { capacity: 2 });
        assert_eq!(set.len(), 2);

        drop(a);
        assert!(!set.contains("a"));
        assert!(set.try_begin("c").is_ok());
    }

    #[test]
    fn test_same_id_never_twice() {
        let set = AnalyzingSet::new(5);
        let _a = set.try_begin("a").unwrap();
        assert_eq!(set.try_begin("a").unwrap_err(), SlotError::AlreadyAnalyzing);
    }

    #[test]
    fn test_cancel_by_id() {
        let set = AnalyzingSet::new(2);
        let permit = set.try_begin("a").unwrap();

        assert!(set.cancel("a", CancelReason::Operator));
        assert!(permit.token().is_cancelled());
        assert!(!set.cancel("a", CancelReason::Operator));
        assert!(!set.cancel("missing", CancelReason::Operator));
    }

    #[test]
    fn test_cancel_all() {
        let set = AnalyzingSet::new(3);
        let a = set.try_begin("a").unwrap();
        let b = set.try_begin("b").unwrap();

        assert_eq!(set.cancel_all(CancelReason::Shutdown), 2);
        assert_eq!(a.token().reason(), Some(CancelReason::Shutdown));
        assert!(b.token().is_cancelled());
    }

    #[test]
    fn test_concurrent_claims_respect_capacity() {
        let set = AnalyzingSet::new(3);
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let set = Arc::clone(&set);
                std::thread::spawn(move || set.try_begin(&format!("id-{}", i)).ok())
            })
            .collect();

        let permits: Vec<AnalysisPermit> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(permits.len(), 3);
        assert_eq!(set.len(), 3);
    }
}
