//! Rollwatch store: merges many concurrently produced log streams into one
//! timestamp-ordered output.
//!
//! Each producer reserves a [`Slot`] and emits into its own bounded channel. A
//! worker per slot moves messages into the shared [`OrderQueue`]; after every
//! move (and on a periodic tick) the queue releases whatever can no longer be
//! overtaken by an older message from another live slot.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, histogram};
use rollwatch_core::{LogEmitter, LogMessage};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod queue;

pub use queue::{OrderQueue, Popped, SlotKey};

#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// How long a message is held back waiting for older ones from slower slots.
    pub grace: Duration,
    /// Per-slot inbound channel capacity; emits beyond it are dropped.
    pub slot_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { grace: Duration::from_millis(100), slot_capacity: 1024 }
    }
}

impl BufferConfig {
    /// Defaults overridden by `ROLLWATCH_GRACE_MS` / `ROLLWATCH_SLOT_CAP`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(ms) = std::env::var("ROLLWATCH_GRACE_MS").ok().and_then(|s| s.parse::<u64>().ok()) {
            cfg.grace = Duration::from_millis(ms);
        }
        if let Some(cap) = std::env::var("ROLLWATCH_SLOT_CAP").ok().and_then(|s| s.parse::<usize>().ok()) {
            cfg.slot_capacity = cap.max(1);
        }
        cfg
    }
}

#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

impl Pending {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

type Item = (LogMessage, Arc<Pending>);

struct State {
    queue: OrderQueue<Item>,
    slots: FxHashMap<String, Slot>,
    out: Option<mpsc::UnboundedSender<LogMessage>>,
    next_key: SlotKey,
}

struct Shared {
    state: Mutex<State>,
    closed: CancellationToken,
    cfg: BufferConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit_ready(state: &mut State) {
        let now = Utc::now();
        let ready = state.queue.drain_ready(now);
        for p in ready {
            Self::deliver(state, p);
        }
    }

    fn deliver(state: &mut State, popped: Popped<Item>) {
        match popped {
            Popped::Emit { item: (msg, pending), arrived, .. } => {
                let held = (Utc::now() - arrived).num_milliseconds().max(0);
                if let Some(out) = &state.out {
                    if out.send(msg).is_ok() {
                        counter!("rollwatch_logbuf_emitted_total", 1u64);
                        histogram!("rollwatch_logbuf_hold_ms", held as f64);
                    }
                }
                pending.done();
            }
            Popped::Discard { item: (_, pending), .. } => {
                counter!("rollwatch_logbuf_discarded_total", 1u64);
                pending.done();
            }
        }
    }
}

/// Multi-producer, single-consumer, timestamp-ordering log buffer.
#[derive(Clone)]
pub struct OrderedLogBuffer {
    shared: Arc<Shared>,
}

impl OrderedLogBuffer {
    /// Create the buffer and its output channel. Must be called inside a tokio runtime.
    pub fn new(cfg: BufferConfig) -> (Self, mpsc::UnboundedReceiver<LogMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: OrderQueue::new(cfg.grace),
                slots: FxHashMap::default(),
                out: Some(tx),
                next_key: 1,
            }),
            closed: CancellationToken::new(),
            cfg,
        });
        spawn_ticker(Arc::downgrade(&shared), shared.closed.clone(), shared.cfg.grace);
        (Self { shared }, rx)
    }

    /// Reserve (or look up) the live slot for `id`.
    pub fn reserve_slot(&self, id: &str) -> Slot {
        let mut st = self.shared.lock();
        if let Some(existing) = st.slots.get(id) {
            return existing.clone();
        }
        let key = st.next_key;
        st.next_key += 1;
        st.queue.open_slot(key);

        let (tx, rx) = mpsc::channel(self.shared.cfg.slot_capacity.max(1));
        let release = self.shared.closed.child_token();
        let pending = Arc::new(Pending::default());
        let slot = Slot {
            inner: Arc::new(SlotInner {
                id: id.to_string(),
                key,
                tx,
                released: AtomicBool::new(false),
                release: release.clone(),
                pending: pending.clone(),
                shared: Arc::downgrade(&self.shared),
            }),
        };
        st.slots.insert(id.to_string(), slot.clone());
        debug!(slot = %id, key, "log slot reserved");
        tokio::spawn(slot_worker(self.shared.clone(), rx, release, key, pending));
        slot
    }

    pub fn live_slots(&self) -> usize {
        self.shared.lock().queue.live_slots()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Emit everything still queued for live slots, then end the output channel.
    pub fn close(&self) {
        if self.shared.closed.is_cancelled() {
            return;
        }
        self.shared.closed.cancel();
        let mut st = self.shared.lock();
        let rest = st.queue.drain_all();
        let flushed = rest.len();
        for p in rest {
            Shared::deliver(&mut st, p);
        }
        for (_, slot) in st.slots.drain() {
            slot.inner.released.store(true, Ordering::SeqCst);
        }
        st.out = None;
        info!(flushed, "log buffer closed");
    }
}

fn spawn_ticker(shared: Weak<Shared>, closed: CancellationToken, grace: Duration) {
    let period = (grace / 2).max(Duration::from_millis(5));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                _ = tick.tick() => {
                    let Some(shared) = shared.upgrade() else { break };
                    let mut st = shared.lock();
                    Shared::emit_ready(&mut st);
                }
            }
        }
    });
}

async fn slot_worker(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<LogMessage>,
    release: CancellationToken,
    key: SlotKey,
    pending: Arc<Pending>,
) {
    loop {
        tokio::select! {
            biased;
            _ = release.cancelled() => break,
            next = rx.recv() => {
                let Some(msg) = next else { break };
                let mut st = shared.lock();
                let ts = msg.timestamp;
                match st.queue.push(key, ts, Utc::now(), (msg, pending.clone())) {
                    Ok(()) => Shared::emit_ready(&mut st),
                    Err(_) => pending.done(),
                }
            }
        }
    }
    // Whatever is still in the channel belongs to a released slot.
    rx.close();
    while rx.try_recv().is_ok() {
        counter!("rollwatch_logbuf_discarded_total", 1u64);
        pending.done();
    }
}

struct SlotInner {
    id: String,
    key: SlotKey,
    tx: mpsc::Sender<LogMessage>,
    released: AtomicBool,
    release: CancellationToken,
    pending: Arc<Pending>,
    shared: Weak<Shared>,
}

/// One producer's lane into the buffer.
#[derive(Clone)]
pub struct Slot {
    inner: Arc<SlotInner>,
}

impl Slot {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst) || self.inner.release.is_cancelled()
    }

    /// Best-effort, never blocks. Returns whether the message was accepted.
    pub fn emit(&self, msg: LogMessage) -> bool {
        if self.is_released() {
            counter!("rollwatch_logbuf_dropped_total", 1u64, "reason" => "released");
            return false;
        }
        self.inner.pending.add();
        match self.inner.tx.try_send(msg) {
            Ok(()) => true,
            Err(_) => {
                self.inner.pending.done();
                counter!("rollwatch_logbuf_dropped_total", 1u64, "reason" => "full");
                false
            }
        }
    }

    /// Stop accepting messages and forget anything not yet emitted. Idempotent.
    pub fn release(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.release.cancel();
        let Some(shared) = self.inner.shared.upgrade() else { return };
        let mut st = shared.lock();
        st.queue.close_slot(self.inner.key);
        let same = st.slots.get(&self.inner.id).map(|s| Arc::ptr_eq(&s.inner, &self.inner)).unwrap_or(false);
        if same {
            st.slots.remove(&self.inner.id);
        }
        Shared::emit_ready(&mut st);
        debug!(slot = %self.inner.id, "log slot released");
    }

    /// Wait until every accepted message has left the buffer. False on timeout.
    pub async fn wait_flushed(&self, max: Duration) -> bool {
        let pending = &self.inner.pending;
        let wait = async {
            loop {
                let notified = pending.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if pending.count.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(max, wait).await.is_ok()
    }
}

/// Pump the buffer's output into a sink until the buffer is closed.
pub fn spawn_emitter(mut rx: mpsc::UnboundedReceiver<LogMessage>, emitter: Arc<dyn LogEmitter>) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut emitted = 0u64;
        while let Some(msg) = rx.recv().await {
            emitter.emit(&msg);
            emitted += 1;
        }
        debug!(emitted, "log emitter drained");
        emitted
    })
}
