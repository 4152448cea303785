//! # bus
//!
//! Topic-based event fan-out with bounded per-subscriber inboxes.
//!
//! Publishing never blocks: a full inbox evicts its oldest entry and bumps
//! the subscriber's drop counter (drop-oldest policy). Delivery is
//! at-most-once and, per topic, preserves the publisher's order. A slow
//! subscriber can therefore lose events but can never stall ingest.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::json;
use tokio::sync::Notify;

use telemetry_types::{
    AlertEvent, AnomalyEvent, AnomalyRegion, HealthSnapshot, ProcessedMeasurement,
};

// ── Topics & events ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Measurement,
    Health,
    Anomaly,
    Region,
    Alert,
}

impl Topic {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "measurement" => Some(Self::Measurement),
            "health" => Some(Self::Health),
            "anomaly" => Some(Self::Anomaly),
            "region" => Some(Self::Region),
            "alert" => Some(Self::Alert),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Measurement => "measurement",
            Self::Health => "health",
            Self::Anomaly => "anomaly",
            Self::Region => "region",
            Self::Alert => "alert",
        }
    }
}

#[derive(Debug, Clone)]
pub enum BusEvent {
    Measurement(ProcessedMeasurement),
    Health {
        device_id: String,
        snapshot: HealthSnapshot,
    },
    Anomaly(AnomalyEvent),
    Regions(Arc<Vec<AnomalyRegion>>),
    Alert(AlertEvent),
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            Self::Measurement(_) => Topic::Measurement,
            Self::Health { .. } => Topic::Health,
            Self::Anomaly(_) => Topic::Anomaly,
            Self::Regions(_) => Topic::Region,
            Self::Alert(_) => Topic::Alert,
        }
    }

    /// Wire payload for websocket delivery.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::Measurement(m) => json!(m),
            Self::Health { device_id, snapshot } => json!({
                "deviceId": device_id,
                "health": snapshot,
            }),
            Self::Anomaly(a) => json!(a),
            Self::Regions(r) => json!(r.as_ref()),
            Self::Alert(a) => json!(a),
        }
    }
}

// ── Inbox ─────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Inbox {
    queue: Mutex<VecDeque<BusEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
}

impl Inbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Drop-oldest push. Returns true if an event was evicted.
    fn push(&self, event: BusEvent) -> bool {
        let evicted = {
            let mut q = self.queue.lock().expect("inbox poisoned");
            let evicted = if q.len() == self.capacity {
                q.pop_front();
                true
            } else {
                false
            };
            q.push_back(event);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    fn pop(&self) -> Option<BusEvent> {
        self.queue.lock().expect("inbox poisoned").pop_front()
    }
}

/// A live subscription. Dropping the handle does not unsubscribe — call
/// [`EventBus::unsubscribe`] with the id, or let the bus outlive you and
/// absorb the drops.
pub struct Subscription {
    id: u64,
    topic: Topic,
    inbox: Arc<Inbox>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Events evicted from this inbox so far.
    pub fn dropped(&self) -> u64 {
        self.inbox.dropped.load(Ordering::Relaxed)
    }

    pub fn try_recv(&self) -> Option<BusEvent> {
        self.inbox.pop()
    }

    /// Wait for the next event. Returns `None` once unsubscribed and drained.
    pub async fn recv(&self) -> Option<BusEvent> {
        loop {
            if let Some(event) = self.inbox.pop() {
                return Some(event);
            }
            if self.inbox.closed.load(Ordering::Acquire) {
                return None;
            }
            self.inbox.notify.notified().await;
        }
    }
}

// ── Bus ───────────────────────────────────────────────────────────────────────

struct Entry {
    id: u64,
    topic: Topic,
    inbox: Arc<Inbox>,
}

pub struct EventBus {
    subscribers: RwLock<Vec<Entry>>,
    next_id: AtomicU64,
    default_capacity: usize,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            default_capacity,
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.subscribe_with_capacity(topic, self.default_capacity)
    }

    pub fn subscribe_with_capacity(&self, topic: Topic, capacity: usize) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inbox = Arc::new(Inbox::new(capacity));
        self.subscribers
            .write()
            .expect("bus poisoned")
            .push(Entry { id, topic, inbox: inbox.clone() });
        Subscription { id, topic, inbox }
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut subs = self.subscribers.write().expect("bus poisoned");
        if let Some(idx) = subs.iter().position(|e| e.id == id) {
            let entry = subs.swap_remove(idx);
            entry.inbox.closed.store(true, Ordering::Release);
            entry.inbox.notify.notify_one();
        }
    }

    /// Deliver to every subscriber of the event's topic. Never blocks.
    pub fn publish(&self, event: BusEvent) {
        let topic = event.topic();
        self.published.fetch_add(1, Ordering::Relaxed);
        let subs = self.subscribers.read().expect("bus poisoned");
        for entry in subs.iter().filter(|e| e.topic == topic) {
            if entry.inbox.push(event.clone()) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().expect("bus poisoned").len()
    }

    pub fn published_total(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
