//! Strict-priority FIFO buffer of events waiting for the next frame.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::types::{Priority, SpaceEvent};

/// Four-tier event queue: `immediate > high > normal > low`, FIFO within a tier.
///
/// Internally synchronized so a `SpaceHandle` on another task can `push` while
/// the scheduler drains. Unbounded; backpressure belongs to callers.
pub struct EventPriorityQueue {
    buckets: Mutex<[VecDeque<SpaceEvent>; 4]>,
}

impl EventPriorityQueue {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(Default::default()),
        }
    }

    pub fn push(&self, event: SpaceEvent) {
        let idx = event.priority.index();
        self.lock()[idx].push_back(event);
    }

    /// Remove the head of the highest non-empty tier.
    pub fn shift(&self) -> Option<SpaceEvent> {
        let mut buckets = self.lock();
        Priority::ALL
            .iter()
            .find_map(|p| buckets[p.index()].pop_front())
    }

    /// Atomically take everything currently queued, in drain order.
    pub fn drain(&self) -> Vec<SpaceEvent> {
        let mut buckets = self.lock();
        let mut out = Vec::with_capacity(buckets.iter().map(VecDeque::len).sum());
        for p in Priority::ALL {
            out.extend(buckets[p.index()].drain(..));
        }
        out
    }

    pub fn len(&self) -> usize {
        self.lock().iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().iter().all(VecDeque::is_empty)
    }

    /// Drop every queued event. Hard resets only.
    pub fn clear(&self) {
        for bucket in self.lock().iter_mut() {
            bucket.clear();
        }
    }

    fn lock(&self) -> MutexGuard<'_, [VecDeque<SpaceEvent>; 4]> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventPriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}
