//! Timer queue driving timeout control events.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

use mio::Token;

/// Identifies what a timeout was armed for.
///
/// Tags let an application keep several timer families apart without
/// tracking every id: cancelling passes the tag back alongside the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutTag {
    /// Periodic heartbeat emission.
    Heartbeat,
    /// Reorder-buffer hole expiry in the ordering layer.
    Ordering,
    /// Deadline attached to an in-flight resolve.
    Resolve,
}

#[derive(Debug, PartialEq, Eq)]
struct TimerEntry {
    deadline: Instant,
    id: u64,
    token: Token,
    tag: TimeoutTag,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.id).cmp(&(other.deadline, other.id))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending timeouts, ordered by deadline.
///
/// Owned by the multiplexer thread; cancellation is lazy — cancelled ids are
/// remembered and skipped when their entry surfaces.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    cancelled: HashSet<u64>,
}

impl TimerQueue {
    pub(crate) fn schedule(&mut self, deadline: Instant, tag: TimeoutTag, token: Token, id: u64) {
        self.heap.push(Reverse(TimerEntry {
            deadline,
            id,
            token,
            tag,
        }));
    }

    pub(crate) fn cancel(&mut self, id: u64) {
        self.cancelled.insert(id);
    }

    /// Time until the next live deadline, saturating at zero.
    pub(crate) fn until_next(&mut self, now: Instant) -> Option<Duration> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.cancelled.contains(&entry.id) {
                let id = entry.id;
                self.heap.pop();
                self.cancelled.remove(&id);
                continue;
            }
            return Some(entry.deadline.saturating_duration_since(now));
        }
        None
    }

    /// Pop every entry whose deadline has passed.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<(Token, TimeoutTag, u64)> {
        let mut fired = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            if self.cancelled.remove(&entry.id) {
                continue;
            }
            fired.push((entry.token, entry.tag, entry.id));
        }
        fired
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut timers = TimerQueue::default();
        let now = Instant::now();
        timers.schedule(now + Duration::from_millis(20), TimeoutTag::Ordering, Token(1), 2);
        timers.schedule(now + Duration::from_millis(10), TimeoutTag::Heartbeat, Token(1), 1);
        let fired = timers.pop_expired(now + Duration::from_millis(30));
        assert_eq!(
            fired,
            vec![
                (Token(1), TimeoutTag::Heartbeat, 1),
                (Token(1), TimeoutTag::Ordering, 2)
            ]
        );
    }

    #[test]
    fn cancelled_entries_are_skipped() {
        let mut timers = TimerQueue::default();
        let now = Instant::now();
        timers.schedule(now, TimeoutTag::Resolve, Token(3), 7);
        timers.cancel(7);
        assert!(timers.pop_expired(now + Duration::from_millis(1)).is_empty());
        assert!(timers.is_empty());
    }

    #[test]
    fn until_next_skips_cancelled_head() {
        let mut timers = TimerQueue::default();
        let now = Instant::now();
        timers.schedule(now + Duration::from_millis(5), TimeoutTag::Heartbeat, Token(1), 1);
        timers.schedule(now + Duration::from_millis(50), TimeoutTag::Heartbeat, Token(1), 2);
        timers.cancel(1);
        let next = timers.until_next(now).expect("deadline");
        assert!(next > Duration::from_millis(5));
    }
}
