use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::xmpp::address::BareAddress;

/// One roster entry, keyed by bare address
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contact {
    pub id: BareAddress,
    pub name: String,
    pub status: ContactStatus,
    pub unread_count: u32,
    pub last_activity: DateTime<Utc>,
}

impl Contact {
    pub fn new(id: BareAddress, name: impl Into<String>, status: ContactStatus) -> Self {
        Contact {
            id,
            name: name.into(),
            status,
            unread_count: 0,
            last_activity: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    Online,
    Offline,
    Away,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

/// A chat message as kept in the per-contact history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: String,
    pub sender_id: BareAddress,
    pub recipient_id: BareAddress,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// The contact this message belongs to
    pub conversation_id: BareAddress,
    pub direction: MessageDirection,
}

impl Message {
    pub fn is_inbound(&self) -> bool {
        self.direction == MessageDirection::Inbound
    }
}
