// XEP-0184: Message Delivery Receipts, minimal read acknowledgment
// https://xmpp.org/extensions/xep-0184.html

use log::{debug, warn};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::xmpp::events::EngineEvent;
use crate::xmpp::stanza;
use crate::xmpp::XmppEngine;

impl XmppEngine {
    /// Reset the contact's unread counter and, when online, acknowledge the
    /// latest inbound message. The receipt is best-effort: send failures are
    /// logged and never surface to the caller.
    pub async fn mark_as_read(&self, contact_id: &str) -> EngineResult<()> {
        let contact = self.resolve_address(contact_id)?;

        if self.shared.roster().reset_unread(&contact) {
            self.shared
                .publish(EngineEvent::UnreadCountChanged(contact.clone(), 0));
        }

        let Some(session) = self.current_session().filter(|s| s.is_online()) else {
            debug!("Not online, skipping read receipt for {}", contact);
            return Ok(());
        };
        let last_inbound = self
            .shared
            .messages()
            .last_inbound(&contact)
            .map(|m| m.id.clone());
        let Some(message_id) = last_inbound else {
            return Ok(());
        };

        let receipt = stanza::read_receipt(&contact, &Uuid::new_v4().to_string(), &message_id);
        match session.send(receipt).await {
            Ok(()) => debug!("Sent read receipt for message {} to {}", message_id, contact),
            Err(e) => warn!("Failed to send read receipt to {}: {}", contact, e),
        }
        Ok(())
    }
}
