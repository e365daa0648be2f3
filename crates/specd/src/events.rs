//! Per-spec event fan-out.
//!
//! A broadcast channel per spec, created on the first subscriber and torn
//! down with the last unsubscribe. New subscribers receive only future
//! events; there is no replay. Emission never blocks the emitting pipeline.

use spec_core::{EventPayload, Id, SpecEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Buffered events per spec channel; slow subscribers lag and drop.
const CHANNEL_CAPACITY: usize = 512;

#[derive(Debug)]
struct SpecChannel {
    tx: broadcast::Sender<SpecEvent>,
    subscribers: usize,
}

/// Registry of per-spec broadcast channels.
#[derive(Debug, Default)]
pub struct EventHub {
    channels: Mutex<HashMap<String, SpecChannel>>,
}

impl EventHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to a spec's event stream. The channel is created on the
    /// first subscriber; the returned handle unsubscribes on drop.
    pub fn subscribe(self: &Arc<Self>, spec_id: &Id) -> Subscription {
        let mut channels = self.channels.lock().expect("event hub lock poisoned");
        let channel = channels
            .entry(spec_id.to_string())
            .or_insert_with(|| SpecChannel {
                tx: broadcast::channel(CHANNEL_CAPACITY).0,
                subscribers: 0,
            });
        channel.subscribers += 1;
        Subscription {
            hub: Arc::clone(self),
            spec_id: spec_id.to_string(),
            rx: channel.tx.subscribe(),
        }
    }

    /// An emitter bound to one spec.
    pub fn emitter(self: &Arc<Self>, spec_id: &Id) -> Emitter {
        Emitter {
            hub: Arc::clone(self),
            spec_id: spec_id.clone(),
        }
    }

    /// Number of live subscribers for a spec (used by tests).
    pub fn subscriber_count(&self, spec_id: &Id) -> usize {
        self.channels
            .lock()
            .expect("event hub lock poisoned")
            .get(spec_id.as_ref())
            .map_or(0, |c| c.subscribers)
    }

    fn emit(&self, event: SpecEvent) {
        let channels = self.channels.lock().expect("event hub lock poisoned");
        if let Some(channel) = channels.get(event.spec_id.as_ref()) {
            // No receivers is fine; events before the first subscriber drop.
            let _ = channel.tx.send(event);
        }
    }

    fn unsubscribe(&self, spec_id: &str) {
        let mut channels = self.channels.lock().expect("event hub lock poisoned");
        if let Some(channel) = channels.get_mut(spec_id) {
            channel.subscribers = channel.subscribers.saturating_sub(1);
            if channel.subscribers == 0 {
                channels.remove(spec_id);
            }
        }
    }
}

/// Subscription handle; dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    hub: Arc<EventHub>,
    spec_id: String,
    pub rx: broadcast::Receiver<SpecEvent>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.spec_id);
    }
}

/// Emitter for one spec's stream. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Emitter {
    hub: Arc<EventHub>,
    spec_id: Id,
}

impl Emitter {
    pub fn spec_id(&self) -> &Id {
        &self.spec_id
    }

    pub fn emit(&self, chunk_id: Option<&Id>, payload: EventPayload) {
        self.hub.emit(SpecEvent::new(
            self.spec_id.clone(),
            chunk_id.cloned(),
            payload,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spec_core::events::{SpecStartPayload, TextPayload};

    #[tokio::test]
    async fn subscriber_receives_future_events() {
        let hub = EventHub::new();
        let spec_id = Id::from_string("s1");
        let emitter = hub.emitter(&spec_id);

        // No subscriber yet: the event is dropped, not buffered.
        emitter.emit(
            None,
            EventPayload::SpecStart(SpecStartPayload {
                spec_id: spec_id.clone(),
                total_chunks: 1,
            }),
        );

        let mut sub = hub.subscribe(&spec_id);
        emitter.emit(
            None,
            EventPayload::Text(TextPayload {
                chunk_id: Id::from_string("c1"),
                text: "hello".to_string(),
            }),
        );

        let event = sub.rx.recv().await.unwrap();
        assert!(matches!(event.payload, EventPayload::Text(_)));
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn channel_torn_down_on_last_unsubscribe() {
        let hub = EventHub::new();
        let spec_id = Id::from_string("s1");

        let sub1 = hub.subscribe(&spec_id);
        let sub2 = hub.subscribe(&spec_id);
        assert_eq!(hub.subscriber_count(&spec_id), 2);

        drop(sub1);
        assert_eq!(hub.subscriber_count(&spec_id), 1);
        drop(sub2);
        assert_eq!(hub.subscriber_count(&spec_id), 0);
    }

    #[tokio::test]
    async fn events_for_different_specs_are_independent() {
        let hub = EventHub::new();
        let a = Id::from_string("a");
        let b = Id::from_string("b");

        let mut sub_a = hub.subscribe(&a);
        let _sub_b = hub.subscribe(&b);

        hub.emitter(&b).emit(
            None,
            EventPayload::SpecStart(SpecStartPayload {
                spec_id: b.clone(),
                total_chunks: 1,
            }),
        );

        assert!(sub_a.rx.try_recv().is_err());
    }
}
