// Outbound notification channel for the UI layer
// Subscribers each get an ordered queue; dropped receivers are pruned on the next publish.

use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::ErrorKind;
use crate::models::{Contact, ContactStatus, Message};
use crate::xmpp::address::BareAddress;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Connected(BareAddress),
    Disconnected,
    Message(Message),
    Presence(BareAddress, ContactStatus),
    ContactsUpdated(Vec<Contact>),
    UnreadCountChanged(BareAddress, u32),
    /// Someone asked to see our presence
    SubscriptionRequest(BareAddress),
    /// Non-fatal problem, such as a failed initial roster fetch
    Warning(ErrorKind, String),
    Error(ErrorKind, String),
}

#[derive(Default)]
struct Subscribers {
    entries: Vec<(u64, mpsc::UnboundedSender<EngineEvent>)>,
}

/// Fan-out of engine events to any number of subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Subscribers>>,
    next_id: Arc<AtomicU64>,
}

/// Receiving side of one subscription. Dropping it unsubscribes lazily;
/// `EventBus::unsubscribe` does so immediately.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        self.rx.try_recv().ok()
    }

    /// Consume the subscription as a `Stream`; it ends once the bus is gone
    pub fn into_stream(self) -> UnboundedReceiverStream<EngineEvent> {
        UnboundedReceiverStream::new(self.rx)
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.entries.push((id, tx));
        }
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.entries.retain(|(entry_id, _)| *entry_id != id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subscribers| subscribers.entries.len())
            .unwrap_or(0)
    }

    pub fn publish(&self, event: EngineEvent) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            log::error!("Event subscriber list poisoned, dropping {:?}", event);
            return;
        };
        let before = subscribers.entries.len();
        subscribers
            .entries
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
        let removed = before - subscribers.entries.len();
        if removed > 0 {
            debug!("Removed {} closed event subscribers", removed);
        }
    }
}
