#![forbid(unsafe_code)]

//! Ordering properties. The merge queue is driven by a simulated clock: each
//! slot produces strictly increasing timestamps and its messages reach the
//! queue some delay after they were stamped. The buffer runs on a real
//! runtime with its slot workers and ticker.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use rollwatch_core::LogMessage;
use rollwatch_store::{BufferConfig, OrderQueue, OrderedLogBuffer, Popped};

const GRACE_MS: i64 = 100;

fn t(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

/// (slot, timestamp ms, arrival ms) per message.
fn schedule(slots: &[Vec<(u16, u16)>]) -> Vec<(u64, i64, i64)> {
    let mut events = Vec::new();
    for (slot, msgs) in slots.iter().enumerate() {
        let mut ts = 0i64;
        for (gap, delay) in msgs {
            ts += 1 + *gap as i64;
            events.push((slot as u64, ts, ts + *delay as i64));
        }
    }
    // Per-slot FIFO: a slot's channel never reorders, so arrival is clamped monotonic.
    let mut last = vec![i64::MIN; slots.len()];
    for e in events.iter_mut() {
        let l = &mut last[e.0 as usize];
        e.2 = e.2.max(*l);
        *l = e.2;
    }
    events.sort_by_key(|e| (e.2, e.1));
    events
}

fn run(events: &[(u64, i64, i64)], slots: usize) -> Vec<(u64, i64)> {
    let mut q = OrderQueue::new(Duration::from_millis(GRACE_MS as u64));
    for s in 0..slots {
        q.open_slot(s as u64);
    }
    let mut out = Vec::new();
    let take = |popped: Vec<Popped<(u64, i64)>>, out: &mut Vec<(u64, i64)>| {
        for p in popped {
            if let Popped::Emit { item, .. } = p {
                out.push(item);
            }
        }
    };
    for (slot, ts, arrival) in events {
        // Ticks between arrivals.
        let now = t(*arrival);
        take(q.drain_ready(now), &mut out);
        q.push(*slot, t(*ts), now, (*slot, *ts)).unwrap();
        take(q.drain_ready(now), &mut out);
    }
    take(q.drain_all(), &mut out);
    out
}

fn slots_strategy(max_delay: u16) -> impl Strategy<Value = Vec<Vec<(u16, u16)>>> {
    prop::collection::vec(prop::collection::vec((0u16..50, 0u16..max_delay), 1..30), 2..5)
}

proptest! {
    #[test]
    fn output_is_ordered_when_delays_stay_inside_grace(slots in slots_strategy(GRACE_MS as u16)) {
        let events = schedule(&slots);
        let out = run(&events, slots.len());
        prop_assert_eq!(out.len(), events.len());
        for w in out.windows(2) {
            prop_assert!(w[0].1 <= w[1].1, "out of order: {:?} then {:?}", w[0], w[1]);
        }
    }

    #[test]
    fn late_producers_never_lose_or_reorder_their_own_lines(slots in slots_strategy(1_000)) {
        let events = schedule(&slots);
        let out = run(&events, slots.len());
        prop_assert_eq!(out.len(), events.len());
        for s in 0..slots.len() as u64 {
            let mine: Vec<i64> = out.iter().filter(|(slot, _)| *slot == s).map(|(_, ts)| *ts).collect();
            prop_assert!(mine.windows(2).all(|w| w[0] < w[1]));
        }
    }
}

/// Drive the real buffer: one task per slot emitting `counts[s]` lines stamped
/// ahead of now, plus a task that releases slot 0 after `release_after` yields.
async fn run_buffer(counts: Vec<usize>, release_after: usize) -> Vec<(usize, usize, i64)> {
    let grace = Duration::from_millis(20);
    let (buf, mut rx) = OrderedLogBuffer::new(BufferConfig { grace, slot_capacity: 1024 });
    let slots: Vec<_> = (0..counts.len()).map(|s| buf.reserve_slot(&format!("p/{s}"))).collect();
    let base = Utc::now() + chrono::Duration::milliseconds(150);
    let stride = counts.len() as i64;

    let mut producers = Vec::new();
    for (s, (slot, count)) in slots.iter().cloned().zip(counts.iter().copied()).enumerate() {
        producers.push(tokio::spawn(async move {
            for i in 0..count {
                let ts = base + chrono::Duration::milliseconds(i as i64 * stride + s as i64);
                slot.emit(LogMessage::new("test", "p", format!("p/{s}"), ts, format!("{s}:{i}")));
                tokio::task::yield_now().await;
            }
        }));
    }
    let released = slots[0].clone();
    let releaser = tokio::spawn(async move {
        for _ in 0..release_after {
            tokio::task::yield_now().await;
        }
        released.release();
    });
    for p in producers {
        p.await.unwrap();
    }
    releaser.await.unwrap();
    for slot in &slots[1..] {
        assert!(slot.wait_flushed(Duration::from_secs(2)).await);
    }
    buf.close();

    let mut out = Vec::new();
    while let Some(m) = rx.recv().await {
        let (s, i) = m.message.split_once(':').unwrap();
        out.push((s.parse().unwrap(), i.parse().unwrap(), m.timestamp.timestamp_millis()));
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn buffer_orders_live_slots_while_one_is_released(
        counts in prop::collection::vec(1usize..25, 3..5),
        release_after in 0usize..30,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let out = rt.block_on(run_buffer(counts.clone(), release_after));

        for w in out.windows(2) {
            prop_assert!(w[0].2 <= w[1].2, "out of order: {:?} then {:?}", w[0], w[1]);
        }
        for (s, count) in counts.iter().enumerate() {
            let mine: Vec<usize> = out.iter().filter(|(slot, ..)| *slot == s).map(|(_, i, _)| *i).collect();
            if s == 0 {
                // A released slot loses its tail, never lines in the middle.
                prop_assert!(mine.iter().enumerate().all(|(n, i)| n == *i), "{:?}", mine);
                prop_assert!(mine.len() <= *count);
            } else {
                prop_assert_eq!(mine, (0..*count).collect::<Vec<_>>());
            }
        }
    }
}
