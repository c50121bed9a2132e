//! # Job Queue
//!
//! Blocking FIFO used between the engine loops. Producers never block; a consumer
//! waits on a condition variable until an item arrives, the timeout runs out, or
//! shutdown wakes every waiter at once.
//!
//! The queue owns a pushed item until [`JobQueue::shift`] hands it to the consumer.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Ordered multi-producer/multi-consumer queue
#[derive(Debug)]
pub struct JobQueue<T> {
    name: &'static str,
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> JobQueue<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A panicking producer can not leave the deque half-updated
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item and wake one waiting consumer
    pub fn push(&self, item: T) {
        self.lock().push_back(item);
        self.available.notify_one();
    }

    /// Take the oldest item, waiting up to `timeout` for one to arrive.
    ///
    /// A zero timeout never waits. Returns `None` when the queue stayed empty or
    /// a shutdown broadcast woke the caller.
    pub fn shift(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self
                .available
                .wait_timeout(items, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            items = guard;
            if result.timed_out() {
                return items.pop_front();
            }
            // Woken without an item: either a broadcast or a competing consumer won
            if items.is_empty() {
                return None;
            }
        }
    }

    /// Instantaneous size snapshot
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove every queued item without handing them to a consumer
    pub fn drain(&self) -> Vec<T> {
        self.lock().drain(..).collect()
    }
}

/// Anything that parks threads and can release them on shutdown
pub trait Wake: Send + Sync {
    fn wake_all(&self);
}

impl<T: Send> Wake for JobQueue<T> {
    fn wake_all(&self) {
        let _items = self.lock();
        self.available.notify_all();
    }
}
