//! Timer queue for one-shot callbacks
//!
//! A min-heap keyed by `(deadline, id)`. Ids grow monotonically, so timers
//! with the same deadline fire in the order they were scheduled. Cancelled
//! timers are dropped from the callback table at once and from the heap
//! lazily when they reach the top, or in one sweep once they make up more
//! than half of it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use super::Runtime;
use super::HandlerResult;

/// Deadline used when `now + delay` is not representable
const FAR_FUTURE: Duration = Duration::from_secs(u32::MAX as u64);

/// Heaps smaller than this are never compacted
const COMPACT_MIN: usize = 64;

/// One-shot timer callback
pub type TimerCallback = Box<dyn FnOnce(&mut Runtime) -> HandlerResult>;

/// Handle to a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Deadline-ordered schedule of one-shot callbacks
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    callbacks: HashMap<TimerId, TimerCallback>,
    next_id: u64,
}

impl TimerQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            callbacks: HashMap::new(),
            next_id: 1,
        }
    }

    /// Insert a timer firing at `deadline`
    pub fn insert(&mut self, deadline: Instant, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.callbacks.insert(id, callback);
        id
    }

    /// Insert a timer that expires after a duration from now
    ///
    /// A delay past the end of the clock's range is clamped to a deadline
    /// far enough out that it never expires in practice.
    pub fn insert_after(&mut self, delay: Duration, callback: TimerCallback) -> TimerId {
        let now = Instant::now();
        let deadline = now
            .checked_add(delay)
            .unwrap_or_else(|| now + FAR_FUTURE);
        self.insert(deadline, callback)
    }

    /// Cancel a timer. Returns false if it already fired or was cancelled.
    pub fn remove(&mut self, id: TimerId) -> bool {
        if self.callbacks.remove(&id).is_none() {
            return false;
        }
        self.compact();
        true
    }

    /// Drop cancelled entries once they outnumber the live ones
    fn compact(&mut self) {
        let stale = self.heap.len().saturating_sub(self.callbacks.len());
        if self.heap.len() >= COMPACT_MIN && stale * 2 > self.heap.len() {
            let callbacks = &self.callbacks;
            self.heap.retain(|Reverse((_, id))| callbacks.contains_key(id));
        }
    }

    /// Whether `id` is still scheduled
    pub fn contains(&self, id: TimerId) -> bool {
        self.callbacks.contains_key(&id)
    }

    /// Get the next expiry time (for calculating poll timeout)
    pub fn next_expiry(&mut self) -> Option<Instant> {
        self.discard_cancelled();
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Calculate timeout until next expiry
    pub fn timeout_until_next(&mut self, now: Instant) -> Option<Duration> {
        self.next_expiry()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Pop every live timer due at `now`, in firing order.
    ///
    /// Callbacks stay in the table until [`take_callback`](Self::take_callback)
    /// so that an earlier callback in the batch can still cancel a later one.
    pub fn take_expired(&mut self, now: Instant) -> Vec<TimerId> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if self.callbacks.contains_key(&id) {
                due.push(id);
            }
        }
        due
    }

    /// Remove and return the callback of a due timer
    pub fn take_callback(&mut self, id: TimerId) -> Option<TimerCallback> {
        self.callbacks.remove(&id)
    }

    fn discard_cancelled(&mut self) {
        while let Some(Reverse((_, id))) = self.heap.peek() {
            if self.callbacks.contains_key(id) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Clear all timers
    pub fn clear(&mut self) {
        self.heap.clear();
        self.callbacks.clear();
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}
