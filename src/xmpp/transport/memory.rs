// In-process transport
// Pairs an engine-side Transport with a MemoryPeer that plays the server:
// it sees every stanza the engine sends and injects inbound events.

use async_trait::async_trait;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use xmpp_parsers::Element;

use super::{Connector, Transport, TransportEvent, TransportEvents};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::xmpp::address::BareAddress;
use crate::xmpp::stanza;

/// Hands out memory transports. Accepts any credentials unless accounts are registered.
#[derive(Clone)]
pub struct MemoryConnector {
    accounts: Arc<Mutex<Option<HashMap<BareAddress, String>>>>,
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
}

/// Queue of peers, one per transport the connector creates
pub struct MemoryPeers {
    rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryPeers {
    pub async fn next(&mut self) -> Option<MemoryPeer> {
        self.rx.recv().await
    }
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryPeers) {
        let (peers_tx, rx) = mpsc::unbounded_channel();
        (
            MemoryConnector {
                accounts: Arc::new(Mutex::new(None)),
                peers_tx,
            },
            MemoryPeers { rx },
        )
    }

    /// Restrict authentication to registered accounts
    pub fn add_account(&self, jid: &BareAddress, password: &str) {
        if let Ok(mut accounts) = self.accounts.lock() {
            accounts
                .get_or_insert_with(HashMap::new)
                .insert(jid.clone(), password.to_string());
        }
    }
}

impl Connector for MemoryConnector {
    fn create(&self, _config: &EngineConfig) -> (Arc<dyn Transport>, TransportEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let identity = Arc::new(Mutex::new(None));

        let transport = MemoryTransport {
            accounts: self.accounts.clone(),
            open: open.clone(),
            identity: identity.clone(),
            events_tx: events_tx.clone(),
            sent_tx,
        };
        let peer = MemoryPeer {
            open,
            identity,
            events_tx,
            sent_rx,
        };
        if self.peers_tx.send(peer).is_err() {
            debug!("Nobody is watching memory peers");
        }
        (Arc::new(transport), events_rx)
    }
}

pub struct MemoryTransport {
    accounts: Arc<Mutex<Option<HashMap<BareAddress, String>>>>,
    open: Arc<AtomicBool>,
    identity: Arc<Mutex<Option<BareAddress>>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    sent_tx: mpsc::UnboundedSender<Element>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, jid: &BareAddress, password: &str) -> bool {
        if self.open.load(Ordering::SeqCst) {
            return true;
        }
        let authorized = match self.accounts.lock() {
            Ok(accounts) => match accounts.as_ref() {
                None => true,
                Some(accounts) => accounts.get(jid).map(|p| p == password).unwrap_or(false),
            },
            Err(_) => false,
        };
        if !authorized {
            info!("Memory transport rejected credentials for {}", jid);
            return false;
        }
        if let Ok(mut identity) = self.identity.lock() {
            *identity = Some(jid.clone());
        }
        self.open.store(true, Ordering::SeqCst);
        let _ = self.events_tx.send(TransportEvent::Opened);
        true
    }

    async fn send(&self, stanza: Element) -> EngineResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(EngineError::ConnectionClosed);
        }
        self.sent_tx
            .send(stanza)
            .map_err(|_| EngineError::Transport("memory peer dropped".to_string()))
    }

    async fn disconnect(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.sent_tx.send(stanza::presence_unavailable());
        let _ = self.sent_tx.send(stanza::framing_close());
        let _ = self.events_tx.send(TransportEvent::Closed);
    }
}

/// Server side of a memory transport
pub struct MemoryPeer {
    open: Arc<AtomicBool>,
    identity: Arc<Mutex<Option<BareAddress>>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    sent_rx: mpsc::UnboundedReceiver<Element>,
}

impl MemoryPeer {
    /// Address the client authenticated as, once connected
    pub fn identity(&self) -> Option<BareAddress> {
        self.identity.lock().ok().and_then(|identity| identity.clone())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Next stanza written by the engine
    pub async fn next_sent(&mut self) -> Option<Element> {
        self.sent_rx.recv().await
    }

    pub async fn next_sent_within(&mut self, wait: Duration) -> Option<Element> {
        tokio::time::timeout(wait, self.sent_rx.recv()).await.ok().flatten()
    }

    pub fn deliver(&self, stanza: Element) {
        let _ = self.events_tx.send(TransportEvent::StanzaReceived(stanza));
    }

    pub fn deliver_xml(&self, xml: &str) -> EngineResult<()> {
        let element = stanza::parse_frame(xml)?;
        self.deliver(element);
        Ok(())
    }

    /// Peer closes the stream
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(TransportEvent::Closed);
    }

    /// Stream dies underneath the session
    pub fn fail(&self, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(TransportEvent::TransportError(reason.to_string()));
    }
}
