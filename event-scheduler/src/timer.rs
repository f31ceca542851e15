//! One-shot timer bookkeeping for the [`crate::scheduler::Scheduler`].
//!
//! The reactor has no timerfd per timer.  Instead every pending timer lives
//! in a [`TimerQueue`] ordered by deadline, and the scheduler shortens its
//! `epoll_wait` timeout so the loop wakes up in time for the earliest one:
//! - [`TimerQueue::next_deadline`]:  how long the next poll may block.
//! - [`TimerQueue::pop_expired`]:   drain everything that is due.
//! - [`TimerQueue::cancel`]:        safe at any time, a no-op once fired.
//!
//! This module only manages state; invoking the callbacks is the caller's job.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Identifies one armed timer.  Ids are never reused within a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// TimerQueue
// ---------------------------------------------------------------------------

/// Deadline-ordered set of pending one-shot timers carrying a payload `T`.
///
/// Two timers with the same deadline fire in arming order because the id is
/// part of the ordering key.
#[derive(Debug)]
pub struct TimerQueue<T> {
    next_id: u64,
    /// `(deadline, id)` → payload.
    pending: BTreeMap<(Instant, u64), T>,
    /// id → deadline, so cancellation does not need a scan.
    deadlines: HashMap<u64, Instant>,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// Arm a timer that becomes due `delay` after `now`.
    pub fn insert(&mut self, now: Instant, delay: Duration, payload: T) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        let deadline = now + delay;
        self.pending.insert((deadline, id), payload);
        self.deadlines.insert(id, deadline);
        TimerId(id)
    }

    /// Remove a pending timer and return its payload.
    ///
    /// Returns `None` when the timer already fired or was never armed here.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        let deadline = self.deadlines.remove(&id.0)?;
        self.pending.remove(&(deadline, id.0))
    }

    /// `true` while `id` is still waiting to fire.
    pub fn contains(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id.0)
    }

    /// Earliest deadline among the pending timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Time left until the earliest deadline, saturating at zero.
    pub fn time_until_next(&self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Remove and return the earliest timer if its deadline is `<= now`.
    pub fn pop_next_expired(&mut self, now: Instant) -> Option<(TimerId, T)> {
        let entry = self.pending.first_entry()?;
        let (deadline, id) = *entry.key();
        if deadline > now {
            return None;
        }
        let payload = entry.remove();
        self.deadlines.remove(&id);
        Some((TimerId(id), payload))
    }

    /// Remove and return every timer whose deadline is `<= now`, earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<(TimerId, T)> {
        let mut expired = Vec::new();
        while let Some(timer) = self.pop_next_expired(now) {
            expired.push(timer);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
