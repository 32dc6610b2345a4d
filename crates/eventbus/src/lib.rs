//! In-memory fan-out over the durable event log (spec §4.1). `push` commits
//! to `sa_store::Store` first, then forwards to matching subscribers over a
//! bounded channel; a subscriber that can't keep up is dropped silently —
//! durability lives in the store, not the channel. Grounded on
//! `gateway::runtime::deliveries::DeliveryStore`'s broadcast-channel fan-out,
//! generalized from one global channel to one bounded channel per
//! subscriber so a slow reader can't starve the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sa_domain::error::Result;
use sa_domain::model::{Event, EventSummary, NewEvent};
use sa_domain::trace::TraceEvent;
use sa_store::{EventFilter, Store};
use tokio::sync::mpsc;

/// Minimum per-subscriber buffer depth (§1c `EventBusConfig::subscriber_buffer`).
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

struct Subscriber {
    streams: Vec<String>,
    tx: mpsc::Sender<Event>,
}

type SubscriberMap = Arc<Mutex<HashMap<u64, Subscriber>>>;

pub struct EventBus {
    store: Arc<Store>,
    subscribers: SubscriberMap,
    next_id: AtomicU64,
    buffer_size: usize,
}

/// Handle returned by `subscribe`. Dropping it deregisters the channel.
pub struct Subscription {
    id: u64,
    subscribers: SubscriberMap,
    pub receiver: mpsc::Receiver<Event>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers.lock().remove(&self.id);
    }
}

impl EventBus {
    pub fn new(store: Arc<Store>, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            store,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            buffer_size: buffer_size.max(DEFAULT_SUBSCRIBER_BUFFER),
        })
    }

    /// §4.1 `push`. Persists, then fans out to subscribers watching `stream`.
    /// Send failures (full buffer, closed receiver) are swallowed — the
    /// event is already durable.
    pub fn push(&self, new_event: NewEvent) -> Result<Event> {
        let event = new_event.into_event();
        self.store.push_event(&event)?;

        TraceEvent::EventPushed {
            stream: event.stream.clone(),
            scope_type: event.scope_type.as_str().to_string(),
            scope_id: event.scope_id.clone(),
            event_id: event.id.clone(),
        }
        .emit();

        let subscribers = self.subscribers.lock();
        for sub in subscribers.values() {
            if sub.streams.iter().any(|s| s == &event.stream) {
                let _ = sub.tx.try_send(event.clone());
            }
        }
        Ok(event)
    }

    pub fn list(&self, stream: &str, filter: &EventFilter) -> Result<Vec<EventSummary>> {
        self.store.list_events(stream, filter)
    }

    pub fn read(&self, stream: &str, ids: &[String]) -> Result<Vec<Event>> {
        self.store.read_events(stream, ids)
    }

    pub fn ack(&self, stream: &str, ids: &[String], reader: &str) -> Result<()> {
        self.store.ack_events(stream, ids, reader)?;
        for id in ids {
            TraceEvent::EventAcked {
                stream: stream.to_string(),
                event_id: id.clone(),
                reader: reader.to_string(),
            }
            .emit();
        }
        Ok(())
    }

    /// §4.1 `subscribe`. Delivers events pushed after this call, for the
    /// given streams, until the returned `Subscription` is dropped.
    pub fn subscribe(&self, streams: Vec<String>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer_size);
        self.subscribers.lock().insert(id, Subscriber { streams, tx });
        Subscription {
            id,
            subscribers: self.subscribers.clone(),
            receiver: rx,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
