//! Cross-context change signal.
//!
//! Browsing contexts sharing the same storage observe each other's changes
//! through an injected [`SignalBus`]. Delivery is best-effort with no
//! ordering guarantee between contexts; each context's local state stays
//! internally consistent regardless.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::error;

/// What changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    ConsentUpdated,
    DataCleared,
    /// Local-only: a consent-gated event was captured. Never broadcast.
    EventCaptured,
}

/// The event payload delivered to listeners and broadcast across contexts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub data: serde_json::Value,
}

impl ChangeEvent {
    pub fn consent_updated(data: serde_json::Value) -> Self {
        Self {
            kind: ChangeKind::ConsentUpdated,
            data,
        }
    }

    pub fn data_cleared() -> Self {
        Self {
            kind: ChangeKind::DataCleared,
            data: serde_json::json!({}),
        }
    }

    pub fn event_captured(data: serde_json::Value) -> Self {
        Self {
            kind: ChangeKind::EventCaptured,
            data,
        }
    }
}

/// Handle identifying an attached context on the bus.
pub type SubscriberId = u64;

pub type BusHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Publish/subscribe abstraction for the cross-context signal.
///
/// `publish` must not deliver the event back to its origin; the publishing
/// store has already notified its own listeners synchronously.
pub trait SignalBus: Send + Sync {
    fn attach(&self, handler: BusHandler) -> SubscriberId;
    fn detach(&self, id: SubscriberId);
    fn publish(&self, origin: SubscriberId, event: &ChangeEvent);
}

/// In-process bus for contexts living in the same process (and for tests).
#[derive(Default)]
pub struct InProcessBus {
    handlers: Mutex<HashMap<SubscriberId, BusHandler>>,
    next_id: AtomicU64,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SignalBus for InProcessBus {
    fn attach(&self, handler: BusHandler) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().insert(id, handler);
        id
    }

    fn detach(&self, id: SubscriberId) {
        self.handlers.lock().remove(&id);
    }

    fn publish(&self, origin: SubscriberId, event: &ChangeEvent) {
        // Snapshot so handlers can attach/detach while we deliver.
        let handlers: Vec<(SubscriberId, BusHandler)> = self
            .handlers
            .lock()
            .iter()
            .map(|(id, h)| (*id, Arc::clone(h)))
            .collect();

        for (id, handler) in handlers {
            if id == origin {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(subscriber = id, "cross-context handler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = ChangeEvent::data_cleared();
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "data_cleared");
        assert_eq!(value["data"], serde_json::json!({}));

        let event = ChangeEvent::consent_updated(serde_json::json!({"consents": {}}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "consent_updated");
    }

    #[test]
    fn test_publish_skips_origin() {
        let bus = InProcessBus::new();
        let a_seen = Arc::new(AtomicUsize::new(0));
        let b_seen = Arc::new(AtomicUsize::new(0));

        let a_count = Arc::clone(&a_seen);
        let a = bus.attach(Arc::new(move |_| {
            a_count.fetch_add(1, Ordering::SeqCst);
        }));
        let b_count = Arc::clone(&b_seen);
        let _b = bus.attach(Arc::new(move |_| {
            b_count.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(a, &ChangeEvent::data_cleared());
        assert_eq!(a_seen.load(Ordering::SeqCst), 0);
        assert_eq!(b_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_handler_does_not_block_others() {
        let bus = InProcessBus::new();
        let _bad = bus.attach(Arc::new(|_| panic!("listener bug")));
        let seen = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&seen);
        let _good = bus.attach(Arc::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(u64::MAX, &ChangeEvent::data_cleared());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detach_stops_delivery() {
        let bus = InProcessBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&seen);
        let id = bus.attach(Arc::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        }));
        bus.detach(id);
        bus.publish(u64::MAX, &ChangeEvent::data_cleared());
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
