//! Message Recorder & Fan-out (§4.4): the single write path for messages,
//! and the single emitter of Subscriber Bus events.

use std::sync::Arc;

use dashmap::DashMap;
use shelley_core::{ConversationId, Message, MessageType};
use shelley_store::ConversationStore;

use crate::bus::BusRegistry;
use crate::error::Result;

/// Invoked when a just-recorded message flips a conversation to idle (§4.4
/// "Agent-end-of-turn detection"). Registered by the Conversation Manager,
/// kept as a one-way channel per §9 ("Working-state callback") rather than
/// a back-pointer into the Manager.
pub type EndOfTurnHook = Arc<dyn Fn() + Send + Sync>;

pub struct Recorder {
    store: Arc<dyn ConversationStore>,
    buses: Arc<BusRegistry>,
    end_of_turn_hooks: DashMap<ConversationId, EndOfTurnHook>,
}

impl Recorder {
    pub fn new(store: Arc<dyn ConversationStore>, buses: Arc<BusRegistry>) -> Self {
        Self {
            store,
            buses,
            end_of_turn_hooks: DashMap::new(),
        }
    }

    pub fn register_end_of_turn_hook(&self, conversation_id: ConversationId, hook: EndOfTurnHook) {
        self.end_of_turn_hooks.insert(conversation_id, hook);
    }

    pub fn unregister(&self, conversation_id: ConversationId) {
        self.end_of_turn_hooks.remove(&conversation_id);
    }

    /// Persist `message`, publish it on the conversation's bus, broadcast a
    /// list-update to every other conversation, and fire the end-of-turn
    /// hook if this message closes the turn (§4.4 steps 3-5).
    pub fn record(&self, conversation_id: ConversationId, message: Message) -> Result<Message> {
        let recorded = self.store.append_message(message)?;

        let bus = self.buses.bus_for(conversation_id);
        let payload = serde_json::json!({
            "messages": [api_message(&recorded)],
            "conversation_id": conversation_id.to_string(),
        });
        bus.publish(recorded.sequence_id, payload);

        self.buses.broadcast_except(
            conversation_id,
            serde_json::json!({
                "conversation_list_update": {
                    "type": "update",
                    "conversation_id": conversation_id.to_string(),
                }
            }),
        );

        if matches!(recorded.message_type, MessageType::Agent | MessageType::Error) && recorded.end_of_turn {
            if let Some(hook) = self.end_of_turn_hooks.get(&conversation_id) {
                hook();
            }
        }

        Ok(recorded)
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn buses(&self) -> &Arc<BusRegistry> {
        &self.buses
    }
}

/// Minimal wire shape for the SSE boundary (§6.4); deliberately separate
/// from the persisted `Message` so storage-layer fields never leak as-is.
/// Public so the gateway crate can render the same shape for SSE catch-up
/// reads as the Recorder publishes for live events.
pub fn api_message(message: &Message) -> serde_json::Value {
    serde_json::json!({
        "id": message.id.to_string(),
        "sequence_id": message.sequence_id.0,
        "type": message.message_type,
        "role": message.role,
        "content": message.content,
        "display_payload": message.display_payload,
        "usage": message.usage,
        "error_kind": message.error_kind,
        "end_of_turn": message.end_of_turn,
        "created_at": message.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelley_core::{Content, Conversation, ErrorKind};
    use shelley_store::SqliteStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn recorder() -> (Recorder, ConversationId) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let conv = Conversation::new_user_initiated(None, None);
        store.create_conversation(&conv).unwrap();
        let buses = Arc::new(BusRegistry::new(16));
        (Recorder::new(store, buses), conv.id)
    }

    #[test]
    fn recording_assigns_sequence_and_publishes() {
        let (recorder, conv_id) = recorder();
        let mut sub = recorder.buses().bus_for(conv_id).subscribe(shelley_core::SequenceId::UNASSIGNED);

        let recorded = recorder
            .record(conv_id, Message::user(conv_id, vec![Content::text("hi")]))
            .unwrap();

        assert_eq!(recorded.sequence_id, shelley_core::SequenceId(1));
        assert!(sub.rx.try_recv().is_ok());
    }

    #[test]
    fn end_of_turn_agent_message_fires_hook() {
        let (recorder, conv_id) = recorder();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        recorder.register_end_of_turn_hook(conv_id, Arc::new(move || fired2.store(true, Ordering::SeqCst)));

        let mut msg = Message::agent(conv_id, vec![Content::text("done")]);
        msg.end_of_turn = true;
        recorder.record(conv_id, msg).unwrap();

        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn context_window_warning_does_not_fire_end_of_turn_hook() {
        let (recorder, conv_id) = recorder();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        recorder.register_end_of_turn_hook(conv_id, Arc::new(move || fired2.store(true, Ordering::SeqCst)));

        recorder
            .record(conv_id, Message::error(conv_id, ErrorKind::ContextWindow, "80% full"))
            .unwrap();

        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn recording_broadcasts_list_update_to_other_conversations_only() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let conv_a = Conversation::new_user_initiated(None, None);
        let conv_b = Conversation::new_user_initiated(None, None);
        store.create_conversation(&conv_a).unwrap();
        store.create_conversation(&conv_b).unwrap();
        let buses = Arc::new(BusRegistry::new(16));
        let recorder = Recorder::new(store, buses);

        let mut sub_a = recorder.buses().bus_for(conv_a.id).subscribe(shelley_core::SequenceId::UNASSIGNED);
        let mut sub_b = recorder.buses().bus_for(conv_b.id).subscribe(shelley_core::SequenceId::UNASSIGNED);

        recorder
            .record(conv_a.id, Message::user(conv_a.id, vec![Content::text("hi")]))
            .unwrap();

        // sub_a gets the message publish; sub_b gets only the broadcast list update.
        assert!(sub_a.rx.try_recv().is_ok());
        assert!(sub_b.rx.try_recv().is_ok());
    }
}
