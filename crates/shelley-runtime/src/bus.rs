//! Subscriber Bus (§4.7): per-conversation multi-consumer event fan-out.
//! Sequenced `Publish` for message events, unsequenced `Broadcast` for
//! metadata/working-state/list-update events. A slow subscriber is dropped
//! rather than allowed to stall producers (§9 "Subscriber Bus drop-slow
//! policy") — the same non-blocking idiom the teacher uses in
//! `EventBroadcaster::send` (`let _ = self.tx.send(...)`), generalized here
//! to one bounded channel per subscriber instead of a shared
//! `tokio::broadcast`, because a subscriber also needs sequence-based replay
//! dedup which `tokio::broadcast` does not provide.

use dashmap::DashMap;
use shelley_core::{ConversationId, SequenceId};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum BusEvent {
    Message { sequence_id: SequenceId, payload: serde_json::Value },
    Broadcast { payload: serde_json::Value },
}

struct Subscriber {
    tx: mpsc::Sender<BusEvent>,
    last_delivered: SequenceId,
}

/// Fan-out for a single conversation. `subscriber_buffer` bounds each
/// subscriber's queue (default from `RuntimeTuning::subscriber_buffer`).
pub struct ConversationBus {
    subscribers: DashMap<u64, Subscriber>,
    next_id: std::sync::atomic::AtomicU64,
    buffer: usize,
}

pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<BusEvent>,
}

impl ConversationBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: std::sync::atomic::AtomicU64::new(0),
            buffer,
        }
    }

    /// Attach a subscriber that has already observed sequences up to and
    /// including `last_seen` (via a catch-up read from the store). Replayed
    /// events with `sequence_id <= last_seen` are skipped (invariant 6, §8).
    pub fn subscribe(&self, last_seen: SequenceId) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer.max(1));
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.subscribers.insert(
            id,
            Subscriber {
                tx,
                last_delivered: last_seen,
            },
        );
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
    }

    /// Sequenced publish. Subscribers that have already seen `sequence_id`
    /// (i.e. reconciling a concurrent catch-up read) are skipped.
    pub fn publish(&self, sequence_id: SequenceId, payload: serde_json::Value) {
        let mut dead = Vec::new();
        for mut entry in self.subscribers.iter_mut() {
            if sequence_id <= entry.last_delivered {
                continue;
            }
            let event = BusEvent::Message { sequence_id, payload: payload.clone() };
            match entry.tx.try_send(event) {
                Ok(()) => entry.last_delivered = sequence_id,
                Err(_) => dead.push(*entry.key()),
            }
        }
        for id in dead {
            tracing::warn!(subscriber_id = id, "dropping slow subscriber on publish");
            self.subscribers.remove(&id);
        }
    }

    /// Unsequenced broadcast. Delivered to every current subscriber
    /// regardless of their last-delivered sequence.
    pub fn broadcast(&self, payload: serde_json::Value) {
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            let event = BusEvent::Broadcast { payload: payload.clone() };
            if entry.tx.try_send(event).is_err() {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            tracing::warn!(subscriber_id = id, "dropping slow subscriber on broadcast");
            self.subscribers.remove(&id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Process-wide registry of per-conversation buses, following the teacher's
/// `DashMap`-keyed-table convention (`AppState.ws_clients`, `active_operations`).
pub struct BusRegistry {
    buses: DashMap<ConversationId, std::sync::Arc<ConversationBus>>,
    buffer: usize,
}

impl BusRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            buses: DashMap::new(),
            buffer,
        }
    }

    pub fn bus_for(&self, conversation_id: ConversationId) -> std::sync::Arc<ConversationBus> {
        self.buses
            .entry(conversation_id)
            .or_insert_with(|| std::sync::Arc::new(ConversationBus::new(self.buffer)))
            .clone()
    }

    /// Broadcast a list-update event to every conversation's bus *except*
    /// `origin` (§4.4 step 5).
    pub fn broadcast_except(&self, origin: ConversationId, payload: serde_json::Value) {
        for entry in self.buses.iter() {
            if *entry.key() != origin {
                entry.value().broadcast(payload.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_at_sequence_n_never_sees_le_n() {
        let bus = ConversationBus::new(8);
        let mut sub = bus.subscribe(SequenceId(5));

        bus.publish(SequenceId(5), serde_json::json!({"n": 5}));
        bus.publish(SequenceId(6), serde_json::json!({"n": 6}));

        let event = sub.rx.try_recv().unwrap();
        match event {
            BusEvent::Message { sequence_id, .. } => assert_eq!(sequence_id, SequenceId(6)),
            _ => panic!("expected message event"),
        }
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers() {
        let bus = ConversationBus::new(8);
        let mut s1 = bus.subscribe(SequenceId::UNASSIGNED);
        let mut s2 = bus.subscribe(SequenceId::UNASSIGNED);

        bus.broadcast(serde_json::json!({"working": true}));

        assert!(s1.rx.try_recv().is_ok());
        assert!(s2.rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn full_buffer_drops_the_slow_subscriber_not_the_producer() {
        let bus = ConversationBus::new(1);
        let sub = bus.subscribe(SequenceId::UNASSIGNED);
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(SequenceId(1), serde_json::json!({"n": 1}));
        bus.publish(SequenceId(2), serde_json::json!({"n": 2}));

        assert_eq!(bus.subscriber_count(), 0);
        drop(sub);
    }

    #[tokio::test]
    async fn registry_broadcast_except_skips_origin() {
        let registry = BusRegistry::new(8);
        let a = ConversationId::new();
        let b = ConversationId::new();
        let mut sub_a = registry.bus_for(a).subscribe(SequenceId::UNASSIGNED);
        let mut sub_b = registry.bus_for(b).subscribe(SequenceId::UNASSIGNED);

        registry.broadcast_except(a, serde_json::json!({"type": "update"}));

        assert!(sub_a.rx.try_recv().is_err());
        assert!(sub_b.rx.try_recv().is_ok());
    }
}
