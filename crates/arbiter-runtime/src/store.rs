//! In-memory conversation store.
//!
//! Conversations live for the lifetime of the process. Each conversation has
//! a turn lock: [`ConversationStore::begin_turn`] waits until no other turn
//! is running on the same id, so messages of concurrent requests are never
//! interleaved. Different conversations never block each other.

use std::collections::HashMap;
use std::sync::Arc;

use arbiter_core::{generate_id, Message};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Errors from conversation lookups.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Conversation not found: {0}")]
    NotFound(String),
}

#[derive(Default)]
struct ConversationSlot {
    turn: Arc<Mutex<()>>,
    messages: RwLock<Vec<Message>>,
}

/// Owns every conversation and its messages.
#[derive(Default)]
pub struct ConversationStore {
    conversations: RwLock<HashMap<String, Arc<ConversationSlot>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a conversation and wait for exclusive access to it.
    ///
    /// A known id resolves to its conversation. An unknown or absent id
    /// creates a new conversation under a freshly generated id.
    pub async fn begin_turn(&self, conversation_id: Option<&str>) -> TurnHandle {
        let (conversation_id, slot) = self.resolve(conversation_id);
        let guard = slot.turn.clone().lock_owned().await;

        TurnHandle {
            conversation_id,
            slot,
            _guard: guard,
        }
    }

    /// Ordered messages of a conversation.
    pub fn history(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        self.conversations
            .read()
            .get(conversation_id)
            .map(|slot| slot.messages.read().clone())
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.conversations.read().contains_key(conversation_id)
    }

    pub fn len(&self) -> usize {
        self.conversations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.read().is_empty()
    }

    fn resolve(&self, requested: Option<&str>) -> (String, Arc<ConversationSlot>) {
        if let Some(id) = requested {
            if let Some(slot) = self.conversations.read().get(id) {
                return (id.to_string(), slot.clone());
            }
        }

        let mut conversations = self.conversations.write();

        // Another request may have created it between the two locks.
        if let Some(id) = requested {
            if let Some(slot) = conversations.get(id) {
                return (id.to_string(), slot.clone());
            }
            tracing::debug!(
                requested = %id,
                "Unknown conversation id, starting a new conversation"
            );
        }

        let id = loop {
            let candidate = generate_id("conv");
            if !conversations.contains_key(&candidate) {
                break candidate;
            }
        };

        let slot = Arc::new(ConversationSlot::default());
        conversations.insert(id.clone(), slot.clone());
        (id, slot)
    }
}

impl std::fmt::Debug for ConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationStore")
            .field("conversations", &self.len())
            .finish()
    }
}

/// Exclusive write access to one conversation for the duration of a turn.
///
/// Dropping the handle ends the turn.
pub struct TurnHandle {
    conversation_id: String,
    slot: Arc<ConversationSlot>,
    _guard: OwnedMutexGuard<()>,
}

impl TurnHandle {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Snapshot of the conversation so far.
    pub fn history(&self) -> Vec<Message> {
        self.slot.messages.read().clone()
    }

    /// Append a message and return a copy of it.
    pub fn append(&self, message: Message) -> Message {
        self.slot.messages.write().push(message.clone());
        message
    }
}
