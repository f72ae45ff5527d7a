// XMPP Presence handling (RFC 6121)
// Interprets inbound presence stanzas and sends our own presence and subscription answers

use log::{debug, info, warn};
use xmpp_parsers::Element;

use crate::error::{EngineError, EngineResult};
use crate::models::ContactStatus;
use crate::xmpp::address::BareAddress;
use crate::xmpp::stanza;
use crate::xmpp::XmppEngine;

/// What an inbound presence stanza means for the engine
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceUpdate {
    Status(BareAddress, ContactStatus),
    SubscriptionRequest(BareAddress),
    Subscribed(BareAddress),
    Unsubscribed(BareAddress),
    Ignored,
}

/// Map a presence stanza. Self-presence (our own other resources) is ignored.
pub fn parse_presence(stanza: &Element, own: &BareAddress) -> PresenceUpdate {
    let Some(from) = stanza.attr("from") else {
        warn!("Received presence stanza without 'from' attribute");
        return PresenceUpdate::Ignored;
    };
    let sender = match BareAddress::parse(from) {
        Ok(sender) => sender,
        Err(e) => {
            // Server or component presence carries no local part
            debug!("Ignoring presence from {}: {}", from, e);
            return PresenceUpdate::Ignored;
        }
    };
    if &sender == own {
        return PresenceUpdate::Ignored;
    }

    match stanza.attr("type").unwrap_or("available") {
        "available" | "" => PresenceUpdate::Status(sender, show_to_status(stanza)),
        "unavailable" => PresenceUpdate::Status(sender, ContactStatus::Offline),
        "subscribe" => {
            info!("Received presence subscription request from {}", sender);
            PresenceUpdate::SubscriptionRequest(sender)
        }
        "subscribed" => {
            info!("Presence subscription to {} accepted", sender);
            PresenceUpdate::Subscribed(sender)
        }
        "unsubscribe" | "unsubscribed" => PresenceUpdate::Unsubscribed(sender),
        "error" => {
            debug!("Presence error from {}", sender);
            PresenceUpdate::Ignored
        }
        other => {
            warn!("Unknown presence type '{}' from {}", other, sender);
            PresenceUpdate::Ignored
        }
    }
}

fn show_to_status(stanza: &Element) -> ContactStatus {
    match stanza
        .children()
        .find(|child| child.name() == "show")
        .map(|show| show.text())
        .as_deref()
        .map(str::trim)
    {
        Some("away") | Some("xa") => ContactStatus::Away,
        _ => ContactStatus::Online,
    }
}

/// Presence stanza announcing `status`
pub fn own_presence(status: ContactStatus) -> Element {
    match status {
        ContactStatus::Online => stanza::presence(None),
        ContactStatus::Away => stanza::presence(Some("away")),
        ContactStatus::Offline => stanza::presence_unavailable(),
    }
}

impl XmppEngine {
    /// Broadcast our own availability
    pub async fn update_presence(&self, status: ContactStatus) -> EngineResult<()> {
        let session = self.online_session()?;
        info!("Setting own presence to {:?}", status);
        session.send(own_presence(status)).await
    }

    /// Approve a subscription request and subscribe back
    pub async fn accept_subscription(&self, address: &str) -> EngineResult<()> {
        let jid = self.resolve_address(address)?;
        let session = self.online_session()?;
        if &jid == session.identity() {
            return Err(EngineError::Validation("cannot subscribe to yourself".to_string()));
        }
        session.send(stanza::presence_to(&jid, "subscribed")).await?;
        session.send(stanza::presence_to(&jid, "subscribe")).await?;
        info!("Accepted subscription request from {}", jid);
        Ok(())
    }
}
