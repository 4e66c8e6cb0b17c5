//! Typed publish/subscribe for sync lifecycle events.
//!
//! Every [`EventKind`] maps to exactly one payload type. Observers register
//! either a typed handler through [`EventBus::on`], a kind-keyed handler
//! through [`EventBus::on_kind`], or take an async stream of all events from
//! [`EventBus::subscribe`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, trace};

use fieldsync_common::{Error, ItemId, Result};

use crate::conflict::Winner;
use crate::item::{Operation, SyncQueueItem};

/// Capacity of the broadcast channel behind [`EventBus::subscribe`].
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Enumerated event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "sync:error")]
    Error,
    #[serde(rename = "sync:item-completed")]
    ItemCompleted,
    #[serde(rename = "sync:conflict-resolved")]
    ConflictResolved,
    #[serde(rename = "sync:batch-processed")]
    BatchProcessed,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Error,
        EventKind::ItemCompleted,
        EventKind::ConflictResolved,
        EventKind::BatchProcessed,
    ];

    /// Wire name, e.g. `sync:error`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Error => "sync:error",
            EventKind::ItemCompleted => "sync:item-completed",
            EventKind::ConflictResolved => "sync:conflict-resolved",
            EventKind::BatchProcessed => "sync:batch-processed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown event '{}'", s)))
    }
}

/// Where a reported error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorSource {
    /// Transmission to the remote endpoint failed or timed out.
    Transmission,
    /// Conflict resolution fell back to the local version.
    Conflict,
    /// The queue store failed.
    Store,
}

/// Payload of `sync:error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncErrorEvent {
    pub source: ErrorSource,
    pub item_id: Option<ItemId>,
    pub model_type: Option<String>,
    /// Failures recorded for the item after this one.
    pub retry_count: Option<u32>,
    /// Whether the item will be attempted again automatically.
    pub will_retry: bool,
    pub message: String,
}

/// Payload of `sync:item-completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemCompleted {
    pub item: SyncQueueItem,
}

/// Payload of `sync:conflict-resolved`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolved {
    pub item_id: ItemId,
    pub model_type: String,
    pub operation: Operation,
    pub strategy: String,
    pub winner: Winner,
    /// Canonical data after resolution.
    pub data: Value,
}

/// Payload of `sync:batch-processed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProcessed {
    /// Items with a recorded outcome in this batch.
    pub count: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Items handed back to pending without an attempt being counted.
    pub released: usize,
    pub conflicts: usize,
    #[serde(with = "crate::config::duration_ms", rename = "durationMs")]
    pub duration: Duration,
}

/// Any sync event.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Error(SyncErrorEvent),
    ItemCompleted(ItemCompleted),
    ConflictResolved(ConflictResolved),
    BatchProcessed(BatchProcessed),
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::Error(_) => EventKind::Error,
            SyncEvent::ItemCompleted(_) => EventKind::ItemCompleted,
            SyncEvent::ConflictResolved(_) => EventKind::ConflictResolved,
            SyncEvent::BatchProcessed(_) => EventKind::BatchProcessed,
        }
    }
}

/// Binds a payload type to its event kind.
pub trait EventPayload: Send + Sync + 'static {
    const KIND: EventKind;

    /// Borrow the payload out of an event of the matching kind.
    fn from_event(event: &SyncEvent) -> Option<&Self>;
}

macro_rules! event_payload {
    ($payload:ty, $variant:ident) => {
        impl EventPayload for $payload {
            const KIND: EventKind = EventKind::$variant;

            fn from_event(event: &SyncEvent) -> Option<&Self> {
                match event {
                    SyncEvent::$variant(payload) => Some(payload),
                    _ => None,
                }
            }
        }

        impl From<$payload> for SyncEvent {
            fn from(payload: $payload) -> Self {
                SyncEvent::$variant(payload)
            }
        }
    };
}

event_payload!(SyncErrorEvent, Error);
event_payload!(ItemCompleted, ItemCompleted);
event_payload!(ConflictResolved, ConflictResolved);
event_payload!(BatchProcessed, BatchProcessed);

/// Handle returned by registration, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Fan-out of sync events to registered handlers and async subscribers.
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
    channel: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus whose async subscribers may lag `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (channel, _) = broadcast::channel(capacity.max(1));
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            channel,
        }
    }

    /// Register a typed handler for the kind bound to `P`.
    pub fn on<P, F>(&self, handler: F) -> SubscriptionId
    where
        P: EventPayload,
        F: Fn(&P) + Send + Sync + 'static,
    {
        self.register(
            P::KIND,
            Arc::new(move |event| {
                if let Some(payload) = P::from_event(event) {
                    handler(payload);
                }
            }),
        )
    }

    /// Register a handler for one event kind.
    pub fn on_kind<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(handler))
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|(sub, _)| *sub == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Receive every event on an async channel.
    ///
    /// Slow receivers observe `RecvError::Lagged` rather than blocking the
    /// engine.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.channel.subscribe()
    }

    /// Number of handlers registered for a kind.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Deliver an event to handlers, in registration order, then to async
    /// subscribers.
    ///
    /// A panicking handler is logged and skipped; the remaining handlers
    /// still run.
    pub fn emit(&self, event: impl Into<SyncEvent>) {
        let event = event.into();
        let kind = event.kind();

        // Handlers run outside the lock so they may register or unregister.
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();

        trace!(event = %kind, handlers = handlers.len(), "Emitting event");

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                error!(event = %kind, "Event handler panicked");
            }
        }

        // No subscribers is fine
        let _ = self.channel.send(event);
    }

    fn register(&self, kind: EventKind, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push((id, handler));
        id
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn batch(count: usize) -> BatchProcessed {
        BatchProcessed {
            count,
            completed: count,
            retried: 0,
            failed: 0,
            released: 0,
            conflicts: 0,
            duration: Duration::from_millis(5),
        }
    }

    fn store_error(message: &str) -> SyncErrorEvent {
        SyncErrorEvent {
            source: ErrorSource::Store,
            item_id: None,
            model_type: None,
            retry_count: None,
            will_retry: true,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(EventKind::Error.to_string(), "sync:error");
        assert_eq!(
            "sync:batch-processed".parse::<EventKind>().unwrap(),
            EventKind::BatchProcessed
        );
        assert!("sync:unknown".parse::<EventKind>().is_err());
        assert_eq!(
            serde_json::to_value(EventKind::ConflictResolved).unwrap(),
            serde_json::json!("sync:conflict-resolved")
        );
    }

    #[test]
    fn test_typed_handler_receives_only_its_kind() {
        let bus = EventBus::new();
        let counts = Arc::new(Mutex::new(Vec::new()));

        let sink = counts.clone();
        bus.on::<BatchProcessed, _>(move |event| sink.lock().unwrap().push(event.count));

        bus.emit(batch(3));
        bus.emit(store_error("disk full"));
        bus.emit(batch(1));

        assert_eq!(*counts.lock().unwrap(), vec![3, 1]);
    }

    #[test]
    fn test_multiple_handlers_per_kind() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            bus.on_kind(EventKind::Error, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.emit(store_error("x"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(bus.handler_count(EventKind::Error), 3);
        assert_eq!(bus.handler_count(EventKind::BatchProcessed), 0);
    }

    #[test]
    fn test_off_removes_handler() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let id = bus.on::<SyncErrorEvent, _>(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(bus.off(id));
        assert!(!bus.off(id));

        bus.emit(store_error("x"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_others() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        bus.on_kind(EventKind::BatchProcessed, |_| panic!("observer bug"));
        let counter = calls.clone();
        bus.on_kind(EventKind::BatchProcessed, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(batch(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_async_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(batch(4));

        match rx.recv().await.unwrap() {
            SyncEvent::BatchProcessed(event) => assert_eq!(event.count, 4),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
