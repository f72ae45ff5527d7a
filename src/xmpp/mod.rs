// XMPP client engine
// Entry point for the protocol session engine. XmppEngine is the command
// surface the UI layer talks to; everything it learns flows back as EngineEvents.

use log::{error, info, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as TokioMutex;

pub mod address;
pub mod connection;
pub mod correlation;
pub mod delivery_receipts;
pub mod events;
pub mod keepalive;
pub mod messages;
pub mod presence;
pub mod registration;
pub mod roster;
pub mod session;
pub mod stanza;
pub mod transport;

pub use address::BareAddress;
pub use connection::TokioXmppConnector;
pub use events::{EngineEvent, EventBus, Subscription};
pub use registration::{RegistrationOutcome, RegistrationState};
pub use session::ConnectionState;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, ErrorKind};
use registration::stream::{RawConnector, WebSocketConnector};
use session::{EngineState, Session};
use transport::Connector;

// Namespaces used across the engine
pub mod ns {
    pub const JABBER_CLIENT: &str = "jabber:client";
    pub const STREAMS: &str = "http://etherx.jabber.org/streams";
    pub const FRAMING: &str = "urn:ietf:params:xml:ns:xmpp-framing";
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    pub const ROSTER: &str = "jabber:iq:roster";
    pub const PING: &str = "urn:xmpp:ping";
    pub const RECEIPTS: &str = "urn:xmpp:receipts";
    pub const REGISTER: &str = "jabber:iq:register";
    pub const FEATURE_REGISTER: &str = "http://jabber.org/features/iq-register";
    pub const DATA_FORMS: &str = "jabber:x:data";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
}

/// Handle to one engine instance. Holds at most one live session at a time;
/// create several engines for several concurrent accounts.
pub struct XmppEngine {
    config: EngineConfig,
    connector: Arc<dyn Connector>,
    raw_connector: Arc<dyn RawConnector>,
    shared: Arc<EngineState>,
    session: Mutex<Option<Arc<Session>>>,
    // Serializes connect attempts; disconnect only needs the slot
    lifecycle: TokioMutex<()>,
    last_identity: Mutex<Option<BareAddress>>,
}

impl XmppEngine {
    pub fn new(config: EngineConfig, connector: Arc<dyn Connector>) -> Self {
        XmppEngine {
            config,
            connector,
            raw_connector: Arc::new(WebSocketConnector),
            shared: Arc::new(EngineState::new(EventBus::new())),
            session: Mutex::new(None),
            lifecycle: TokioMutex::new(()),
            last_identity: Mutex::new(None),
        }
    }

    /// Engine backed by tokio-xmpp for sessions and WebSocket for registration
    pub fn with_config(config: EngineConfig) -> Self {
        Self::new(config, Arc::new(TokioXmppConnector))
    }

    pub fn with_raw_connector(mut self, raw_connector: Arc<dyn RawConnector>) -> Self {
        self.raw_connector = raw_connector;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> Subscription {
        self.shared.events().subscribe()
    }

    pub fn unsubscribe(&self, subscription_id: u64) {
        self.shared.events().unsubscribe(subscription_id);
    }

    /// Connect and authenticate. `username` may be a bare username, in which
    /// case the configured domain is appended. Returns false on bad input,
    /// rejected credentials or an unreachable server.
    pub async fn connect(&self, username: &str, password: &str) -> bool {
        let identity = match self.resolve_address(username) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Refusing to connect: {}", e);
                self.shared
                    .publish(EngineEvent::Error(ErrorKind::Validation, e.to_string()));
                return false;
            }
        };
        if password.is_empty() {
            let e = EngineError::Validation("password is empty".to_string());
            self.shared
                .publish(EngineEvent::Error(e.kind(), e.to_string()));
            return false;
        }

        let _guard = self.lifecycle.lock().await;
        if let Some(existing) = self.current_session() {
            if existing.is_online() && existing.identity() == &identity {
                info!("Already connected as {}", identity);
                return true;
            }
            self.take_session();
            existing.close().await;
        }
        self.reset_if_new_identity(&identity);

        // Published before the handshake so disconnect() can cancel it
        let session = Session::start(
            &self.config,
            self.connector.as_ref(),
            self.shared.clone(),
            identity.clone(),
        );
        *self.session_slot() = Some(session.clone());

        match session.establish(password).await {
            Ok(()) => true,
            Err(e) => {
                if !self.release_session(&session) {
                    info!("Connection attempt as {} cancelled by disconnect", identity);
                    return false;
                }
                error!("Failed to connect as {}: {}", identity, e);
                self.shared
                    .publish(EngineEvent::Error(e.kind(), e.to_string()));
                false
            }
        }
    }

    /// Close the session politely, or cancel a connection attempt in
    /// progress. No-op when neither exists.
    pub async fn disconnect(&self) {
        match self.take_session() {
            Some(session) => session.close().await,
            None => info!("No active session to disconnect"),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.current_session()
            .map(|session| session.is_online())
            .unwrap_or(false)
    }

    pub fn state(&self) -> ConnectionState {
        self.current_session()
            .map(|session| session.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Authenticated identity of the live session
    pub fn identity(&self) -> Option<BareAddress> {
        self.current_session()
            .filter(|session| session.is_online())
            .map(|session| session.identity().clone())
    }

    /// Correlated requests still awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.current_session()
            .map(|session| session.pending_requests())
            .unwrap_or(0)
    }

    /// Create an account over a fresh raw stream; no session is needed.
    /// An existing account with the same name counts as success.
    pub async fn register_account(&self, username: &str, password: &str) -> EngineResult<RegistrationOutcome> {
        registration::register_account(
            &self.config,
            self.raw_connector.as_ref(),
            self.connector.as_ref(),
            username,
            password,
        )
        .await
    }

    fn session_slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<Session>>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn current_session(&self) -> Option<Arc<Session>> {
        self.session_slot().clone()
    }

    fn take_session(&self) -> Option<Arc<Session>> {
        self.session_slot().take()
    }

    /// Clear the slot if it still holds `session`. False when someone else
    /// already took it.
    fn release_session(&self, session: &Arc<Session>) -> bool {
        let mut slot = self.session_slot();
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, session) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn online_session(&self) -> EngineResult<Arc<Session>> {
        self.current_session()
            .filter(|session| session.is_online())
            .ok_or(EngineError::NotConnected)
    }

    /// Normalize a contact or account id, appending the configured domain to
    /// bare usernames
    pub(crate) fn resolve_address(&self, input: &str) -> EngineResult<BareAddress> {
        BareAddress::with_default_domain(input, &self.config.domain)
    }

    fn reset_if_new_identity(&self, identity: &BareAddress) {
        let mut last = self
            .last_identity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if last.as_ref() != Some(identity) {
            if last.is_some() {
                info!("Switching account to {}, clearing contacts and history", identity);
            }
            self.shared.roster().clear();
            self.shared.messages().clear();
            *last = Some(identity.clone());
        }
    }
}
