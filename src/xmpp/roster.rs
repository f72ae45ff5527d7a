// XMPP Roster management
// Local contact model plus the roster operations exposed on XmppEngine

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use xmpp_parsers::Element;

use crate::error::{EngineError, EngineResult};
use crate::models::{Contact, ContactStatus};
use crate::xmpp::address::BareAddress;
use crate::xmpp::events::EngineEvent;
use crate::xmpp::stanza::{self, IqType};
use crate::xmpp::{ns, XmppEngine};

/// One `<item/>` of a roster query
#[derive(Debug, Clone, PartialEq)]
pub struct RosterItem {
    pub jid: BareAddress,
    pub name: Option<String>,
    pub subscription: Option<String>,
}

impl RosterItem {
    pub fn is_removal(&self) -> bool {
        self.subscription.as_deref() == Some("remove")
    }
}

/// Parse the items of a `jabber:iq:roster` query, skipping unusable ones
pub fn parse_items(query: &Element) -> Vec<RosterItem> {
    query
        .children()
        .filter(|child| child.is("item", ns::ROSTER))
        .filter_map(|item| {
            let raw = item.attr("jid")?;
            match BareAddress::parse(raw) {
                Ok(jid) => Some(RosterItem {
                    jid,
                    name: item
                        .attr("name")
                        .map(str::trim)
                        .filter(|name| !name.is_empty())
                        .map(str::to_string),
                    subscription: item.attr("subscription").map(str::to_string),
                }),
                Err(e) => {
                    warn!("Skipping roster item with bad jid '{}': {}", raw, e);
                    None
                }
            }
        })
        .collect()
}

/// In-memory contact directory. Keeps first-seen order; identity is unique.
#[derive(Debug, Default, Clone)]
pub struct Roster {
    contacts: Vec<Contact>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn get(&self, id: &BareAddress) -> Option<&Contact> {
        self.contacts.iter().find(|c| &c.id == id)
    }

    fn get_mut(&mut self, id: &BareAddress) -> Option<&mut Contact> {
        self.contacts.iter_mut().find(|c| &c.id == id)
    }

    pub fn contains(&self, id: &BareAddress) -> bool {
        self.get(id).is_some()
    }

    pub fn snapshot(&self) -> Vec<Contact> {
        self.contacts.clone()
    }

    /// Merge-or-create from roster data. New entries start offline and are
    /// named after the local part when no name is given. Returns true if created.
    pub fn merge(&mut self, id: &BareAddress, name: Option<&str>) -> bool {
        let name = name.map(str::trim).filter(|n| !n.is_empty());
        if let Some(contact) = self.get_mut(id) {
            if let Some(name) = name {
                contact.name = name.to_string();
            }
            return false;
        }
        let name = name.unwrap_or_else(|| id.local_part());
        self.contacts
            .push(Contact::new(id.clone(), name, ContactStatus::Offline));
        true
    }

    /// Contact for an inbound message sender, created online if unknown.
    /// Returns true if created.
    pub fn ensure_from_message(&mut self, id: &BareAddress) -> bool {
        if self.contains(id) {
            return false;
        }
        self.contacts
            .push(Contact::new(id.clone(), id.local_part(), ContactStatus::Online));
        true
    }

    pub fn remove(&mut self, id: &BareAddress) -> Option<Contact> {
        let pos = self.contacts.iter().position(|c| &c.id == id)?;
        Some(self.contacts.remove(pos))
    }

    /// Update a known contact's status; unknown ids are ignored
    pub fn set_status(&mut self, id: &BareAddress, status: ContactStatus) -> bool {
        match self.get_mut(id) {
            Some(contact) => {
                contact.status = status;
                true
            }
            None => false,
        }
    }

    pub fn mark_all_offline(&mut self) {
        for contact in &mut self.contacts {
            contact.status = ContactStatus::Offline;
        }
    }

    pub fn increment_unread(&mut self, id: &BareAddress) -> Option<u32> {
        let contact = self.get_mut(id)?;
        contact.unread_count = contact.unread_count.saturating_add(1);
        Some(contact.unread_count)
    }

    pub fn reset_unread(&mut self, id: &BareAddress) -> bool {
        match self.get_mut(id) {
            Some(contact) => {
                contact.unread_count = 0;
                true
            }
            None => false,
        }
    }

    pub fn touch(&mut self, id: &BareAddress, at: DateTime<Utc>) {
        if let Some(contact) = self.get_mut(id) {
            contact.last_activity = at;
        }
    }

    /// Apply a roster fetch result or push. Items with subscription="remove"
    /// drop the contact. Returns true when anything changed.
    pub fn apply_items(&mut self, items: &[RosterItem]) -> bool {
        let mut changed = false;
        for item in items {
            if item.is_removal() {
                if self.remove(&item.jid).is_some() {
                    debug!("Roster push removed {}", item.jid);
                    changed = true;
                }
            } else {
                let before = self.get(&item.jid).map(|c| c.name.clone());
                let created = self.merge(&item.jid, item.name.as_deref());
                let after = self.get(&item.jid).map(|c| c.name.clone());
                changed |= created || before != after;
            }
        }
        changed
    }

    pub fn clear(&mut self) {
        self.contacts.clear();
    }
}

impl XmppEngine {
    /// Snapshot of the contact list
    pub fn get_contacts(&self) -> Vec<Contact> {
        self.shared.roster().snapshot()
    }

    /// Add a contact to the server roster and ask for their presence.
    /// Returns false on invalid input, when offline, or when the server refuses;
    /// the local roster is left untouched on failure. Concurrent calls for the
    /// same address are not de-duplicated.
    pub async fn add_to_roster(&self, address: &str, name: Option<&str>) -> bool {
        match self.try_add_to_roster(address, name).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to add {} to roster: {}", address, e);
                false
            }
        }
    }

    async fn try_add_to_roster(&self, address: &str, name: Option<&str>) -> EngineResult<()> {
        let jid = self.resolve_address(address)?;
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| jid.local_part())
            .to_string();
        let session = self.online_session()?;
        if &jid == session.identity() {
            return Err(EngineError::Validation("cannot add your own address".to_string()));
        }

        let iq = stanza::iq(
            IqType::Set,
            &session.next_id(),
            None,
            Some(stanza::roster_item(&jid, Some(&name), false)),
        );
        info!("Sending add contact request for {}", jid);
        session.request(iq).await?;
        session.send(stanza::presence_to(&jid, "subscribe")).await?;
        info!("Subscription request sent to {}", jid);

        let contacts = {
            let mut roster = self.shared.roster();
            roster.merge(&jid, Some(&name));
            roster.snapshot()
        };
        self.shared.publish(EngineEvent::ContactsUpdated(contacts));
        Ok(())
    }

    /// Remove a contact from the server roster and cancel subscriptions both ways.
    /// Message history for the contact is kept.
    pub async fn remove_from_roster(&self, address: &str) -> EngineResult<()> {
        let jid = self.resolve_address(address)?;
        let session = self.online_session()?;

        let iq = stanza::iq(
            IqType::Set,
            &session.next_id(),
            None,
            Some(stanza::roster_item(&jid, None, true)),
        );
        info!("Sending remove contact request for {}", jid);
        session.request(iq).await?;

        for kind in ["unsubscribe", "unsubscribed"] {
            if let Err(e) = session.send(stanza::presence_to(&jid, kind)).await {
                warn!("Failed to send {} to {}: {}", kind, jid, e);
            }
        }

        let contacts = {
            let mut roster = self.shared.roster();
            roster.remove(&jid);
            roster.snapshot()
        };
        self.shared.publish(EngineEvent::ContactsUpdated(contacts));
        Ok(())
    }
}
