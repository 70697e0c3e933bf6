//! Trait abstractions for the conversation runtime
//!
//! Observers receive notifications from one controller; the context provider
//! supplies the system prompt for each outgoing request.

use crate::llm::{Message, PreviewBlock};
use crate::state_machine::SessionStatus;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Receives notifications from a single controller
///
/// All methods default to no-ops. They are called synchronously from the
/// exchange task and must not block.
pub trait ConversationObserver: Send + Sync {
    /// A message was committed to history
    fn on_message_appended(&self, _message: &Message) {}

    /// Live preview of the streaming response; `None` clears it.
    /// Advisory only.
    fn on_live_preview(&self, _preview: Option<&[PreviewBlock]>) {}

    fn on_status_change(&self, _status: SessionStatus) {}
}

/// Supplies the system prompt, once per outgoing request
pub trait ContextProvider: Send + Sync {
    fn system_prompt(&self) -> String;
}

impl<F> ContextProvider for F
where
    F: Fn() -> String + Send + Sync,
{
    fn system_prompt(&self) -> String {
        self()
    }
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

impl<T: ConversationObserver + ?Sized> ConversationObserver for Arc<T> {
    fn on_message_appended(&self, message: &Message) {
        (**self).on_message_appended(message);
    }

    fn on_live_preview(&self, preview: Option<&[PreviewBlock]>) {
        (**self).on_live_preview(preview);
    }

    fn on_status_change(&self, status: SessionStatus) {
        (**self).on_status_change(status);
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Observers registered on one controller
#[derive(Default)]
pub(crate) struct ObserverSet {
    next_id: u64,
    observers: Vec<(SubscriptionId, Arc<dyn ConversationObserver>)>,
}

impl ObserverSet {
    pub(crate) fn subscribe(&mut self, observer: Arc<dyn ConversationObserver>) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.observers.push((id, observer));
        id
    }

    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        self.observers.len() != before
    }

    /// Snapshot so notifications run without holding the registry lock
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn ConversationObserver>> {
        self.observers.iter().map(|(_, o)| o.clone()).collect()
    }
}

// ============================================================================
// Broadcast adapter
// ============================================================================

/// Notification forwarded to async consumers
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    MessageAppended(Message),
    Preview(Option<Vec<PreviewBlock>>),
    StatusChanged(SessionStatus),
}

/// Observer that republishes every notification on a broadcast channel
pub struct BroadcastObserver {
    tx: broadcast::Sender<ConversationEvent>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.tx.subscribe()
    }

    fn send(&self, event: ConversationEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }
}

impl ConversationObserver for BroadcastObserver {
    fn on_message_appended(&self, message: &Message) {
        self.send(ConversationEvent::MessageAppended(message.clone()));
    }

    fn on_live_preview(&self, preview: Option<&[PreviewBlock]>) {
        self.send(ConversationEvent::Preview(preview.map(<[PreviewBlock]>::to_vec)));
    }

    fn on_status_change(&self, status: SessionStatus) {
        self.send(ConversationEvent::StatusChanged(status));
    }
}
