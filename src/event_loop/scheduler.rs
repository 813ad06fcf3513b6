//! Timer bookkeeping for the event loop.
//!
//! Time is always passed in by the caller, so the scheduler itself never reads
//! the clock and can be driven with synthetic instants in tests.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// Cancel handle for a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug)]
struct Entry<T> {
    token: T,
    deadline: Instant,
    period: Option<Duration>,
}

/// One-shot and periodic timers keyed by [`TimerId`].
///
/// Cancelled timers are dropped from the entry table immediately; their heap
/// slots are discarded lazily when they reach the top.
#[derive(Debug)]
pub struct Scheduler<T> {
    next_id: u64,
    queue: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, Entry<T>>,
}

impl<T: Clone> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            queue: BinaryHeap::new(),
            entries: HashMap::new(),
        }
    }

    /// Fire `token` once, `delay` after `now`.
    pub fn once(&mut self, now: Instant, delay: Duration, token: T) -> TimerId {
        self.insert(now + delay, None, token)
    }

    /// Fire `token` every `period`, first at `now + period`.
    pub fn every(&mut self, now: Instant, period: Duration, token: T) -> TimerId {
        self.insert(now + period, Some(period), token)
    }

    fn insert(&mut self, deadline: Instant, period: Option<Duration>, token: T) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            Entry {
                token,
                deadline,
                period,
            },
        );
        self.queue.push(Reverse((deadline, id)));
        TimerId(id)
    }

    /// Cancel a timer. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.entries.remove(&id.0).is_some()
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id.0)
    }

    /// Cancel every outstanding timer.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest deadline among live timers.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_stale();
        self.queue.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Pop a single timer due at or before `now`.
    ///
    /// Timers are handed out one at a time so a handler that cancels another
    /// due timer prevents it from firing in the same tick. Periodic timers are
    /// re-armed before being returned; if the loop fell behind by more than one
    /// period the next deadline is measured from `now` rather than replaying
    /// missed ticks.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, T)> {
        self.discard_stale();
        let Reverse((deadline, id)) = *self.queue.peek()?;
        if deadline > now {
            return None;
        }
        self.queue.pop();

        let period = self.entries.get(&id)?.period;
        match period {
            Some(period) => {
                let entry = self.entries.get_mut(&id)?;
                let mut next = deadline + period;
                if next <= now {
                    next = now + period;
                }
                entry.deadline = next;
                let token = entry.token.clone();
                self.queue.push(Reverse((next, id)));
                Some((TimerId(id), token))
            }
            None => self
                .entries
                .remove(&id)
                .map(|entry| (TimerId(id), entry.token)),
        }
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse((deadline, id))) = self.queue.peek() {
            match self.entries.get(id) {
                Some(entry) if entry.deadline == *deadline => break,
                _ => {
                    self.queue.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_once_fires_after_delay() {
        let start = Instant::now();
        let mut timers = Scheduler::new();
        timers.once(start, ms(500), "timeout");

        assert_eq!(timers.next_deadline(), Some(start + ms(500)));
        assert!(timers.pop_due(start + ms(499)).is_none());
        let (_, token) = timers.pop_due(start + ms(500)).unwrap();
        assert_eq!(token, "timeout");
        assert!(timers.is_empty());
        assert!(timers.pop_due(start + ms(10_000)).is_none());
    }

    #[test]
    fn test_due_timers_come_out_in_deadline_order() {
        let start = Instant::now();
        let mut timers = Scheduler::new();
        timers.once(start, ms(300), 3);
        timers.once(start, ms(100), 1);
        timers.once(start, ms(200), 2);

        let later = start + ms(1000);
        let order: Vec<i32> = std::iter::from_fn(|| timers.pop_due(later).map(|(_, t)| t)).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_cancel_prevents_firing() {
        let start = Instant::now();
        let mut timers = Scheduler::new();
        let id = timers.once(start, ms(100), "restart");

        assert!(timers.is_armed(id));
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        assert!(timers.pop_due(start + ms(200)).is_none());
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_periodic_rearms() {
        let start = Instant::now();
        let mut timers = Scheduler::new();
        let id = timers.every(start, ms(1000), "check");

        assert!(timers.pop_due(start + ms(999)).is_none());
        assert_eq!(timers.pop_due(start + ms(1000)).unwrap().0, id);
        assert_eq!(timers.next_deadline(), Some(start + ms(2000)));
        assert!(timers.is_armed(id));
    }

    #[test]
    fn test_periodic_skips_missed_ticks() {
        let start = Instant::now();
        let mut timers = Scheduler::new();
        timers.every(start, ms(100), "tick");

        let late = start + ms(450);
        assert!(timers.pop_due(late).is_some());
        // Only one tick is delivered for the stall, then the next is a full period away.
        assert!(timers.pop_due(late).is_none());
        assert_eq!(timers.next_deadline(), Some(late + ms(100)));
    }

    #[test]
    fn test_clear_cancels_everything() {
        let start = Instant::now();
        let mut timers = Scheduler::new();
        timers.every(start, ms(10), "a");
        timers.once(start, ms(20), "b");

        timers.clear();
        assert!(timers.is_empty());
        assert!(timers.pop_due(start + ms(100)).is_none());
    }
}
