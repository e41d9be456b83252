//! Timestamp-ordered merge queue shared by all log slots.
//!
//! Pure data structure: no clock of its own, no locking. `OrderedLogBuffer`
//! wraps it in a mutex and feeds it wall-clock time.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashSet;

pub type SlotKey = u64;

struct Entry<T> {
    timestamp: DateTime<Utc>,
    seq: u64,
    slot: SlotKey,
    arrived: DateTime<Utc>,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Ties keep arrival order, which keeps per-slot FIFO.
        self.timestamp.cmp(&other.timestamp).then(self.seq.cmp(&other.seq))
    }
}

/// What happened to an entry leaving the queue.
#[derive(Debug, PartialEq, Eq)]
pub enum Popped<T> {
    Emit { item: T, slot: SlotKey, arrived: DateTime<Utc> },
    /// Its slot was released before it could be emitted.
    Discard { item: T, slot: SlotKey },
}

pub struct OrderQueue<T> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    live: FxHashSet<SlotKey>,
    grace: Duration,
    seq: u64,
}

impl<T> OrderQueue<T> {
    pub fn new(grace: Duration) -> Self {
        Self { heap: BinaryHeap::new(), live: FxHashSet::default(), grace, seq: 0 }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn live_slots(&self) -> usize {
        self.live.len()
    }

    pub fn open_slot(&mut self, slot: SlotKey) {
        self.live.insert(slot);
    }

    /// Queued entries of a closed slot are discarded as they surface.
    pub fn close_slot(&mut self, slot: SlotKey) {
        self.live.remove(&slot);
    }

    /// Returns false (and drops nothing into the heap) when the slot is not live.
    pub fn push(&mut self, slot: SlotKey, timestamp: DateTime<Utc>, arrived: DateTime<Utc>, item: T) -> Result<(), T> {
        if !self.live.contains(&slot) {
            return Err(item);
        }
        self.seq += 1;
        self.heap.push(Reverse(Entry { timestamp, seq: self.seq, slot, arrived, item }));
        Ok(())
    }

    fn is_ready(&self, entry: &Entry<T>, now: DateTime<Utc>) -> bool {
        // Nobody else can deliver an older message.
        if self.live.len() == 1 {
            return true;
        }
        match chrono::Duration::from_std(self.grace) {
            Ok(grace) => entry.timestamp <= now - grace,
            Err(_) => false,
        }
    }

    /// Pop the minimum if it may leave the queue at `now`.
    pub fn pop_ready(&mut self, now: DateTime<Utc>) -> Option<Popped<T>> {
        let ready = {
            let Reverse(top) = self.heap.peek()?;
            !self.live.contains(&top.slot) || self.is_ready(top, now)
        };
        if !ready {
            return None;
        }
        let Reverse(e) = self.heap.pop()?;
        if self.live.contains(&e.slot) {
            Some(Popped::Emit { item: e.item, slot: e.slot, arrived: e.arrived })
        } else {
            Some(Popped::Discard { item: e.item, slot: e.slot })
        }
    }

    /// Everything that may leave at `now`, in order.
    pub fn drain_ready(&mut self, now: DateTime<Utc>) -> Vec<Popped<T>> {
        let mut out = Vec::new();
        while let Some(p) = self.pop_ready(now) {
            out.push(p);
        }
        out
    }

    /// Empty the queue regardless of the grace window (shutdown).
    pub fn drain_all(&mut self) -> Vec<Popped<T>> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(Reverse(e)) = self.heap.pop() {
            if self.live.contains(&e.slot) {
                out.push(Popped::Emit { item: e.item, slot: e.slot, arrived: e.arrived });
            } else {
                out.push(Popped::Discard { item: e.item, slot: e.slot });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn emitted(v: Vec<Popped<&'static str>>) -> Vec<&'static str> {
        v.into_iter()
            .filter_map(|p| match p {
                Popped::Emit { item, .. } => Some(item),
                Popped::Discard { .. } => None,
            })
            .collect()
    }

    #[test]
    fn single_live_slot_emits_immediately() {
        let mut q = OrderQueue::new(Duration::from_millis(100));
        q.open_slot(1);
        q.push(1, t(1_000), t(1_000), "a").unwrap();
        assert_eq!(emitted(q.drain_ready(t(1_000))), vec!["a"]);
    }

    #[test]
    fn holds_recent_messages_while_others_may_still_arrive() {
        let mut q = OrderQueue::new(Duration::from_millis(100));
        q.open_slot(1);
        q.open_slot(2);
        q.push(2, t(1_000), t(1_000), "late-ts").unwrap();
        assert!(q.drain_ready(t(1_050)).is_empty());
        q.push(1, t(990), t(1_060), "early-ts").unwrap();
        assert!(q.drain_ready(t(1_060)).is_empty());
        assert_eq!(emitted(q.drain_ready(t(1_100))), vec!["early-ts", "late-ts"]);
    }

    #[test]
    fn released_slot_entries_are_discarded() {
        let mut q = OrderQueue::new(Duration::from_millis(100));
        q.open_slot(1);
        q.open_slot(2);
        q.push(1, t(0), t(0), "gone").unwrap();
        q.push(2, t(5), t(5), "kept").unwrap();
        q.close_slot(1);
        let out = q.drain_ready(t(5));
        assert_eq!(out, vec![Popped::Discard { item: "gone", slot: 1 }, Popped::Emit { item: "kept", slot: 2, arrived: t(5) }]);
        assert!(q.push(1, t(6), t(6), "after").is_err());
    }

    #[test]
    fn equal_timestamps_keep_arrival_order() {
        let mut q = OrderQueue::new(Duration::from_millis(10));
        q.open_slot(1);
        q.open_slot(2);
        q.push(1, t(0), t(0), "first").unwrap();
        q.push(2, t(0), t(0), "second").unwrap();
        q.push(1, t(0), t(0), "third").unwrap();
        assert_eq!(emitted(q.drain_ready(t(100))), vec!["first", "second", "third"]);
    }

    #[test]
    fn drain_all_ignores_grace() {
        let mut q = OrderQueue::new(Duration::from_secs(60));
        q.open_slot(1);
        q.open_slot(2);
        q.push(2, t(2), t(2), "b").unwrap();
        q.push(1, t(1), t(1), "a").unwrap();
        assert_eq!(emitted(q.drain_all()), vec!["a", "b"]);
        assert!(q.is_empty());
    }
}
