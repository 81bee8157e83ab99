//! FIFO of qualified events awaiting analysis.
//!
//! Items enter through [`WorkQueue::enqueue`] once the engagement gate
//! qualifies them and leave through timer-driven batch drains. A drain is
//! single-flight: while a [`DrainPermit`] is alive, further
//! [`WorkQueue::begin_drain`] calls return `None`.
//!
//! Items older than the configured maximum age at drain time are dropped
//! and counted, never handed to analysis.

use crate::event::TokenEvent;
use crate::gate::EngagementSnapshot;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A qualified event waiting in the queue.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub event: TokenEvent,
    pub engagement: EngagementSnapshot,
    pub enqueued_at: Instant,
}

impl QueueItem {
    pub fn new(event: TokenEvent, engagement: EngagementSnapshot) -> Self {
        Self {
            event,
            engagement,
            enqueued_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// Items taken by one drain.
#[derive(Debug, Default)]
pub struct DrainedBatch {
    /// Fresh items, in FIFO order.
    pub ready: Vec<QueueItem>,
    /// Items dropped for exceeding the maximum age.
    pub expired: Vec<QueueItem>,
}

/// In-memory work queue.
pub struct WorkQueue {
    items: Mutex<VecDeque<QueueItem>>,
    draining: AtomicBool,
    max_item_age: Duration,
    expired_total: AtomicU64,
}

impl WorkQueue {
    pub fn new(max_item_age: Duration) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            max_item_age,
            expired_total: AtomicU64::new(0),
        }
    }

    /// Append a qualified item to the back of the queue.
    pub fn enqueue(&self, item: QueueItem) {
        let mut items = self.items.lock();
        items.push_back(item);
        debug!(depth = items.len(), "Item enqueued");
    }

    /// Put an item back at the front of the queue, keeping its original
    /// enqueue time.
    pub fn requeue_front(&self, item: QueueItem) {
        self.items.lock().push_front(item);
    }

    /// Start a drain. Returns `None` if another drain is still in progress.
    pub fn begin_drain(&self) -> Option<DrainPermit<'_>> {
        self.draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DrainPermit { queue: self })
    }

    /// Take up to `max_size` items in one single-flight drain.
    pub fn drain_batch(&self, max_size: usize) -> Option<DrainedBatch> {
        self.begin_drain().map(|permit| permit.take(max_size))
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn max_item_age(&self) -> Duration {
        self.max_item_age
    }

    /// Items dropped for age since the queue was created.
    pub fn expired_total(&self) -> u64 {
        self.expired_total.load(Ordering::Relaxed)
    }
}

/// Exclusive right to drain the queue. Releases the single-flight guard on drop.
pub struct DrainPermit<'a> {
    queue: &'a WorkQueue,
}

impl DrainPermit<'_> {
    /// Pop up to `max_size` items, splitting them into fresh and expired.
    ///
    /// Expired items do not count toward `max_size`.
    pub fn take(&self, max_size: usize) -> DrainedBatch {
        let mut batch = DrainedBatch::default();
        let mut items = self.queue.items.lock();

        while batch.ready.len() < max_size {
            let Some(item) = items.pop_front() else {
                break;
            };

            if item.age() > self.queue.max_item_age {
                batch.expired.push(item);
            } else {
                batch.ready.push(item);
            }
        }

        if !batch.expired.is_empty() {
            self.queue
                .expired_total
                .fetch_add(batch.expired.len() as u64, Ordering::Relaxed);
            warn!(
                expired = batch.expired.len(),
                max_age_secs = self.queue.max_item_age.as_secs(),
                "Dropped stale queue items"
            );
        }

        batch
    }
}

impl Drop for DrainPermit<'_> {
    fn drop(&mut self) {
        self.queue.draining.store(false, Ordering::Release);
    }
}
