// Message store and outbound chat messages

use chrono::Utc;
use log::{debug, info};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{Message, MessageDirection};
use crate::xmpp::address::BareAddress;
use crate::xmpp::events::EngineEvent;
use crate::xmpp::stanza;
use crate::xmpp::XmppEngine;

/// Per-contact history. Append-only, kept in insertion order.
#[derive(Debug, Default)]
pub struct MessageStore {
    conversations: HashMap<BareAddress, Vec<Message>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, message: Message) {
        self.conversations
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message);
    }

    pub fn history(&self, conversation: &BareAddress) -> Vec<Message> {
        self.conversations
            .get(conversation)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self, conversation: &BareAddress) -> usize {
        self.conversations.get(conversation).map_or(0, Vec::len)
    }

    /// Most recent message received from the contact
    pub fn last_inbound(&self, conversation: &BareAddress) -> Option<&Message> {
        self.conversations
            .get(conversation)?
            .iter()
            .rev()
            .find(|m| m.is_inbound())
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
    }
}

impl XmppEngine {
    /// History with one contact; empty for unknown or malformed ids
    pub fn get_messages(&self, contact_id: &str) -> Vec<Message> {
        match self.resolve_address(contact_id) {
            Ok(id) => self.shared.messages().history(&id),
            Err(e) => {
                debug!("No history for '{}': {}", contact_id, e);
                Vec::new()
            }
        }
    }

    /// Send a chat message and record it. Delivery is not awaited; the
    /// returned record is already in the conversation history.
    pub async fn send_message(&self, contact_id: &str, text: &str) -> EngineResult<Message> {
        let recipient = self.resolve_address(contact_id)?;
        if text.trim().is_empty() {
            return Err(EngineError::Validation("message body is empty".to_string()));
        }
        let session = self.online_session()?;

        let id = Uuid::new_v4().to_string();
        session
            .send(stanza::chat_message(&recipient, &id, text))
            .await?;
        info!("Sent message {} to {}", id, recipient);

        let now = Utc::now();
        let message = Message {
            id,
            sender_id: session.identity().clone(),
            recipient_id: recipient.clone(),
            content: text.to_string(),
            timestamp: now,
            conversation_id: recipient.clone(),
            direction: MessageDirection::Outbound,
        };
        self.shared.messages().append(message.clone());
        self.shared.roster().touch(&recipient, now);
        self.shared.publish(EngineEvent::Message(message.clone()));
        Ok(message)
    }
}
