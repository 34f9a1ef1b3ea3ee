use std::collections::{HashSet, VecDeque};

use crate::runtime::types::TaskKey;

/// Result of [`ConcurrencyLimiter::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was free; the caller must dispatch the task now.
    Dispatch,
    /// All slots are held; the task waits for a [`ConcurrencyLimiter::release`].
    Queued,
}

/// Admission control for one batch of submissions.
///
/// A task holds its slot from admission until its terminal status is
/// observed, not merely until its submit request returns. Every terminal
/// outcome (completion, failure, timeout, cancellation, failed submission)
/// must be reported through [`Self::release`], which hands back the next
/// queued task to dispatch.
///
/// The limiter only tracks keys. Queued inputs stay untouched in their
/// task records so any pre-processing happens at dispatch time.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    capacity: usize,
    active: HashSet<TaskKey>,
    queue: VecDeque<TaskKey>,
}

impl ConcurrencyLimiter {
    /// Create a limiter admitting at most `capacity` tasks at once.
    ///
    /// A capacity of zero would strand every task, so it is raised to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            active: HashSet::new(),
            queue: VecDeque::new(),
        }
    }

    /// A limiter that never queues.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    pub fn holds_slot(&self, key: TaskKey) -> bool {
        self.active.contains(&key)
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty() && self.queue.is_empty()
    }

    /// Admit `key`, either into a free slot or onto the back of the queue.
    ///
    /// Admitting a key that is already tracked is a no-op reporting its
    /// current placement.
    pub fn admit(&mut self, key: TaskKey) -> Admission {
        if self.active.contains(&key) {
            return Admission::Dispatch;
        }
        if self.queue.contains(&key) {
            return Admission::Queued;
        }
        if self.active.len() < self.capacity {
            self.active.insert(key);
            Admission::Dispatch
        } else {
            self.queue.push_back(key);
            Admission::Queued
        }
    }

    /// Report that `key` reached a terminal state.
    ///
    /// Frees its slot (or drops it from the queue if it never got one) and
    /// promotes the oldest queued task when there is room. The promoted key
    /// already owns its slot when returned.
    pub fn release(&mut self, key: TaskKey) -> Option<TaskKey> {
        if !self.active.remove(&key) {
            self.queue.retain(|queued| *queued != key);
        }
        if self.active.len() >= self.capacity {
            return None;
        }
        let next = self.queue.pop_front()?;
        self.active.insert(next);
        Some(next)
    }
}
