// Transport abstraction
// One persistent ordered stream to the server. Sessions own exactly one transport;
// a Connector makes a fresh one for every connection attempt.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use xmpp_parsers::Element;

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::xmpp::address::BareAddress;

pub mod memory;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Authenticated and bound, ready for stanzas
    Opened,
    StanzaReceived(Element),
    /// Stream ended cleanly, by us or the peer
    Closed,
    TransportError(String),
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open and authenticate the stream. Returns false, without raising, on a
    /// malformed address, rejected credentials or timeout.
    async fn connect(&self, jid: &BareAddress, password: &str) -> bool;

    async fn send(&self, stanza: Element) -> EngineResult<()>;

    /// Send unavailable presence and a stream close, then release the stream.
    /// No-op when not connected.
    async fn disconnect(&self);
}

pub trait Connector: Send + Sync {
    fn create(&self, config: &EngineConfig) -> (Arc<dyn Transport>, TransportEvents);
}
