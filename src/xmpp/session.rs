// Session lifecycle and inbound dispatch
// One Session per connection attempt. A dispatcher task drains the transport's
// events in stream order, so contact and message state is only ever mutated by
// one inbound handler at a time.

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;
use xmpp_parsers::Element;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::models::{Message, MessageDirection};
use crate::xmpp::address::BareAddress;
use crate::xmpp::correlation::Correlator;
use crate::xmpp::events::{EngineEvent, EventBus};
use crate::xmpp::messages::MessageStore;
use crate::xmpp::presence::{self, PresenceUpdate};
use crate::xmpp::roster::{self, Roster, RosterItem};
use crate::xmpp::stanza::{self, ChatMessage, InboundStanza, IqType};
use crate::xmpp::transport::{Connector, Transport, TransportEvent, TransportEvents};
use crate::xmpp::ns;

const DISPATCH_DRAIN: Duration = Duration::from_secs(2);
const CONNECT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Online,
    Closing,
    Errored,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State owned by the engine and shared with every session it creates
pub(crate) struct EngineState {
    events: EventBus,
    roster: Mutex<Roster>,
    messages: Mutex<MessageStore>,
}

impl EngineState {
    pub(crate) fn new(events: EventBus) -> Self {
        EngineState {
            events,
            roster: Mutex::new(Roster::new()),
            messages: Mutex::new(MessageStore::new()),
        }
    }

    pub(crate) fn roster(&self) -> MutexGuard<'_, Roster> {
        lock(&self.roster)
    }

    pub(crate) fn messages(&self) -> MutexGuard<'_, MessageStore> {
        lock(&self.messages)
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn publish(&self, event: EngineEvent) {
        self.events.publish(event);
    }
}

/// Everything the dispatcher and the command side share for one connection
struct SessionCore {
    identity: BareAddress,
    transport: Arc<dyn Transport>,
    correlator: Correlator,
    state: Mutex<ConnectionState>,
    // Only sessions that reached Online report Disconnected
    went_online: AtomicBool,
    finished: AtomicBool,
    shared: Arc<EngineState>,
}

pub(crate) struct Session {
    core: Arc<SessionCore>,
    connect_timeout: Duration,
    request_timeout: Duration,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// A session in the connecting state with its dispatcher running. Nothing
    /// has been sent yet; `establish` drives the handshake.
    pub(crate) fn start(
        config: &EngineConfig,
        connector: &dyn Connector,
        shared: Arc<EngineState>,
        identity: BareAddress,
    ) -> Arc<Session> {
        let (transport, events) = connector.create(config);
        let core = Arc::new(SessionCore {
            identity,
            transport,
            correlator: Correlator::new(),
            state: Mutex::new(ConnectionState::Connecting),
            went_online: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            shared,
        });
        // Dispatch starts before the stream opens so nothing the server sends
        // ahead of the roster result is lost
        let dispatcher = tokio::spawn(core.clone().run(events));
        Arc::new(Session {
            core,
            connect_timeout: config.connect_timeout() + CONNECT_GRACE,
            request_timeout: config.request_timeout(),
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Run the connect sequence: authenticate, announce presence, fetch the
    /// roster, then go online. A failed roster fetch only raises a warning.
    /// A concurrent `close` makes this fail with ConnectionClosed and the
    /// session never reports Connected.
    pub(crate) async fn establish(&self, password: &str) -> EngineResult<()> {
        let identity = self.core.identity.clone();
        let transport = self.core.transport.clone();

        info!("Connecting to XMPP server as {}", identity);
        let connected = tokio::time::timeout(self.connect_timeout, transport.connect(&identity, password))
            .await
            .unwrap_or(false);
        if self.state() != ConnectionState::Connecting {
            return Err(self.setup_interrupted().await);
        }
        if !connected {
            self.abandon().await;
            return Err(EngineError::Transport(format!(
                "could not connect or authenticate as {}",
                identity
            )));
        }

        if let Err(e) = transport.send(stanza::presence(None)).await {
            error!("Failed to send initial presence: {}", e);
            self.abandon().await;
            return Err(e);
        }

        let iq = stanza::iq(IqType::Get, &self.next_id(), None, Some(stanza::roster_query()));
        info!("Sending roster request");
        if let Err(e) = self.request(iq).await {
            if self.state() != ConnectionState::Connecting {
                return Err(self.setup_interrupted().await);
            }
            warn!("Initial roster fetch failed: {}", e);
            self.core
                .shared
                .publish(EngineEvent::Warning(e.kind(), format!("Roster unavailable: {}", e)));
        }

        if !self.core.go_online() {
            return Err(self.setup_interrupted().await);
        }
        info!("Session online as {}", identity);
        self.core.shared.publish(EngineEvent::Connected(identity));
        Ok(())
    }

    /// The stream closed or `close` ran while the handshake was in flight
    async fn setup_interrupted(&self) -> EngineError {
        warn!("Connection for {} went away during setup", self.core.identity);
        self.abandon().await;
        EngineError::ConnectionClosed
    }

    pub(crate) fn identity(&self) -> &BareAddress {
        &self.core.identity
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *lock(&self.core.state)
    }

    pub(crate) fn is_online(&self) -> bool {
        self.state() == ConnectionState::Online
    }

    pub(crate) fn next_id(&self) -> String {
        self.core.correlator.next_id()
    }

    pub(crate) fn pending_requests(&self) -> usize {
        self.core.correlator.pending_count()
    }

    pub(crate) async fn send(&self, stanza: Element) -> EngineResult<()> {
        self.core.transport.send(stanza).await
    }

    /// Correlated request bounded by the configured request timeout
    pub(crate) async fn request(&self, stanza: Element) -> EngineResult<Element> {
        self.core
            .correlator
            .request(self.core.transport.as_ref(), stanza, self.request_timeout)
            .await
    }

    /// Polite shutdown. Pending requests fail with ConnectionClosed at once.
    pub(crate) async fn close(&self) {
        self.core.begin_close();
        self.core.correlator.fail_all(EngineError::ConnectionClosed);
        self.core.transport.disconnect().await;

        let dispatcher = lock(&self.dispatcher).take();
        if let Some(mut handle) = dispatcher {
            if tokio::time::timeout(DISPATCH_DRAIN, &mut handle).await.is_err() {
                warn!("Dispatcher did not stop within {:?}, aborting", DISPATCH_DRAIN);
                handle.abort();
            }
        }
        self.core.finish(None);
    }

    /// Tear down a session that never came online. Safe to run alongside
    /// `close`; both converge on Disconnected.
    async fn abandon(&self) {
        if let Some(handle) = lock(&self.dispatcher).take() {
            handle.abort();
        }
        self.core.transport.disconnect().await;
        self.core.finish(None);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.dispatcher).take() {
            handle.abort();
        }
    }
}

impl SessionCore {
    /// Connecting -> Online, marking the session as one that must report
    /// its disconnect
    fn go_online(&self) -> bool {
        let mut state = lock(&self.state);
        if *state != ConnectionState::Connecting {
            return false;
        }
        *state = ConnectionState::Online;
        self.went_online.store(true, Ordering::SeqCst);
        true
    }

    fn begin_close(&self) {
        let mut state = lock(&self.state);
        if *state != ConnectionState::Disconnected {
            *state = ConnectionState::Closing;
        }
    }

    /// Converge on Disconnected. Idempotent: only the first caller fails the
    /// pending requests and raises events.
    fn finish(&self, error: Option<&str>) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = lock(&self.state);
            *state = if error.is_some() {
                ConnectionState::Errored
            } else {
                ConnectionState::Closing
            };
        }

        self.correlator.fail_all(EngineError::ConnectionClosed);
        // A session that never came online is reported by connect() itself
        let was_up = self.went_online.load(Ordering::SeqCst);
        if was_up {
            self.shared.roster().mark_all_offline();
            if let Some(reason) = error {
                self.shared
                    .publish(EngineEvent::Error(ErrorKind::Transport, reason.to_string()));
            }
        }

        *lock(&self.state) = ConnectionState::Disconnected;
        if was_up {
            info!("Session for {} disconnected", self.identity);
            self.shared.publish(EngineEvent::Disconnected);
        }
    }

    async fn run(self: Arc<Self>, mut events: TransportEvents) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Opened => debug!("Transport opened for {}", self.identity),
                TransportEvent::StanzaReceived(stanza) => self.dispatch(stanza).await,
                TransportEvent::Closed => {
                    info!("XMPP stream closed");
                    self.finish(None);
                    return;
                }
                TransportEvent::TransportError(reason) => {
                    error!("XMPP transport failed: {}", reason);
                    self.finish(Some(&reason));
                    return;
                }
            }
        }
        debug!("Transport event channel ended");
        self.finish(None);
    }

    async fn dispatch(&self, stanza: Element) {
        let classified = stanza::classify(&stanza);
        // Roster results are applied before their requester wakes up
        if let InboundStanza::RosterPush(iq) = &classified {
            self.handle_roster_iq(iq).await;
        }
        if self.correlator.resolve(&stanza) {
            return;
        }

        match classified {
            InboundStanza::RosterPush(_) => {}
            InboundStanza::Message(message) => self.handle_message(message),
            InboundStanza::Presence(presence) => self.handle_presence(&presence),
            InboundStanza::Iq(iq) => self.handle_iq(&iq).await,
            InboundStanza::Unknown => debug!("Dropping unhandled <{}> stanza", stanza.name()),
        }
    }

    async fn handle_roster_iq(&self, iq: &Element) {
        let Some(query) = iq.get_child("query", ns::ROSTER) else {
            return;
        };
        match stanza::iq_type(iq) {
            Some(IqType::Result) => {
                let solicited = iq
                    .attr("id")
                    .map(|id| self.correlator.is_pending(id))
                    .unwrap_or(false);
                if !solicited {
                    debug!("Ignoring unsolicited roster result");
                    return;
                }
                let items = roster::parse_items(query);
                info!("Found {} contacts in roster", items.len());
                self.apply_roster(&items, true);
            }
            Some(IqType::Set) => {
                // RFC 6121: pushes come from our own bare address or carry no from
                if let Some(from) = iq.attr("from") {
                    if BareAddress::parse(from).ok().as_ref() != Some(&self.identity) {
                        warn!("Ignoring roster push from {}", from);
                        return;
                    }
                }
                let items = roster::parse_items(query);
                debug!("Roster push with {} items", items.len());
                self.apply_roster(&items, false);
                if let Err(e) = self.transport.send(stanza::iq_result_for(iq)).await {
                    warn!("Failed to acknowledge roster push: {}", e);
                }
            }
            _ => {}
        }
    }

    fn apply_roster(&self, items: &[RosterItem], always_publish: bool) {
        let contacts = {
            let mut roster = self.shared.roster();
            let changed = roster.apply_items(items);
            (changed || always_publish).then(|| roster.snapshot())
        };
        if let Some(contacts) = contacts {
            self.shared.publish(EngineEvent::ContactsUpdated(contacts));
        }
    }

    fn handle_message(&self, inbound: ChatMessage) {
        let now = Utc::now();
        let sender = inbound.from;
        let (unread, created) = {
            let mut roster = self.shared.roster();
            let created = roster.ensure_from_message(&sender);
            let unread = roster.increment_unread(&sender).unwrap_or(1);
            roster.touch(&sender, now);
            (unread, created.then(|| roster.snapshot()))
        };

        let message = Message {
            id: inbound.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            sender_id: sender.clone(),
            recipient_id: self.identity.clone(),
            content: inbound.body,
            timestamp: now,
            conversation_id: sender.clone(),
            direction: MessageDirection::Inbound,
        };
        debug!("Received message {} from {}", message.id, sender);
        self.shared.messages().append(message.clone());

        if let Some(contacts) = created {
            self.shared.publish(EngineEvent::ContactsUpdated(contacts));
        }
        self.shared.publish(EngineEvent::Message(message));
        self.shared
            .publish(EngineEvent::UnreadCountChanged(sender, unread));
    }

    fn handle_presence(&self, stanza: &Element) {
        match presence::parse_presence(stanza, &self.identity) {
            PresenceUpdate::Status(from, status) => {
                if !self.shared.roster().set_status(&from, status) {
                    debug!("Presence from {} who is not in the roster", from);
                }
                self.shared.publish(EngineEvent::Presence(from, status));
            }
            PresenceUpdate::SubscriptionRequest(from) => {
                self.shared.publish(EngineEvent::SubscriptionRequest(from));
            }
            PresenceUpdate::Subscribed(from) | PresenceUpdate::Unsubscribed(from) => {
                debug!("Subscription state with {} changed", from);
            }
            PresenceUpdate::Ignored => {}
        }
    }

    async fn handle_iq(&self, iq: &Element) {
        let reply = match stanza::iq_type(iq) {
            Some(IqType::Get) if iq.get_child("ping", ns::PING).is_some() => {
                stanza::iq_result_for(iq)
            }
            Some(IqType::Get) | Some(IqType::Set) => {
                debug!("Refusing unsupported iq {:?}", iq.attr("id"));
                stanza::iq_error_for(iq, "service-unavailable")
            }
            _ => {
                debug!("Dropping late or unmatched iq response {:?}", iq.attr("id"));
                return;
            }
        };
        if let Err(e) = self.transport.send(reply).await {
            warn!("Failed to answer iq: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmpp::transport::memory::{MemoryConnector, MemoryPeer};

    async fn expect_roster_request(peer: &mut MemoryPeer) -> String {
        let presence = peer.next_sent().await.unwrap();
        assert_eq!(presence.name(), "presence");
        let iq = peer.next_sent().await.unwrap();
        assert!(iq.get_child("query", ns::ROSTER).is_some());
        iq.attr("id").unwrap().to_string()
    }

    fn shared() -> (Arc<EngineState>, crate::xmpp::events::Subscription) {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        (Arc::new(EngineState::new(bus)), sub)
    }

    async fn open(
        config: &EngineConfig,
        connector: &MemoryConnector,
        shared: Arc<EngineState>,
        identity: BareAddress,
    ) -> EngineResult<Arc<Session>> {
        let session = Session::start(config, connector, shared, identity);
        session.establish("pw").await?;
        Ok(session)
    }

    #[tokio::test]
    async fn test_open_applies_roster_before_online() {
        let (connector, mut peers) = MemoryConnector::new();
        let (shared, mut events) = shared();
        let identity = BareAddress::parse("alice@example.com").unwrap();

        let opening = {
            let shared = shared.clone();
            let identity = identity.clone();
            tokio::spawn(async move {
                open(&EngineConfig::default(), &connector, shared, identity).await
            })
        };
        let mut peer = peers.next().await.unwrap();
        let id = expect_roster_request(&mut peer).await;
        peer.deliver_xml(&format!(
            "<iq xmlns='jabber:client' type='result' id='{}'><query xmlns='jabber:iq:roster'><item jid='bob@example.com' name='Bob'/></query></iq>",
            id
        ))
        .unwrap();

        let session = opening.await.unwrap().unwrap();
        assert!(session.is_online());
        assert_eq!(shared.roster().len(), 1);
        assert!(matches!(events.recv().await, Some(EngineEvent::ContactsUpdated(c)) if c.len() == 1));
        assert_eq!(events.recv().await, Some(EngineEvent::Connected(identity)));
    }

    #[tokio::test]
    async fn test_transport_error_during_setup_fails_open() {
        let (connector, mut peers) = MemoryConnector::new();
        let (shared, mut events) = shared();
        let identity = BareAddress::parse("alice@example.com").unwrap();

        let opening = {
            let shared = shared.clone();
            tokio::spawn(async move {
                open(&EngineConfig::default(), &connector, shared, identity).await
            })
        };
        let mut peer = peers.next().await.unwrap();
        let _ = expect_roster_request(&mut peer).await;
        peer.fail("reset by peer");

        assert!(matches!(opening.await.unwrap(), Err(EngineError::ConnectionClosed)));
        // connect() reports the failure itself
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_close_during_roster_fetch_cancels_setup() {
        let (connector, mut peers) = MemoryConnector::new();
        let (shared, mut events) = shared();
        let identity = BareAddress::parse("alice@example.com").unwrap();
        let mut config = EngineConfig::default();
        config.request_timeout_ms = 5_000;

        let session = Session::start(&config, &connector, shared.clone(), identity);
        let mut peer = peers.next().await.unwrap();
        let started = std::time::Instant::now();
        let (result, _) = tokio::join!(session.establish("pw"), async {
            let _ = expect_roster_request(&mut peer).await;
            session.close().await;
        });

        assert!(matches!(result, Err(EngineError::ConnectionClosed)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.pending_requests(), 0);
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (connector, mut peers) = MemoryConnector::new();
        let (shared, mut events) = shared();
        let identity = BareAddress::parse("alice@example.com").unwrap();
        let mut config = EngineConfig::default();
        config.request_timeout_ms = 50;

        let opening = {
            let shared = shared.clone();
            tokio::spawn(async move { open(&config, &connector, shared, identity).await })
        };
        let _peer = peers.next().await.unwrap();
        let session = opening.await.unwrap().unwrap();

        session.close().await;
        session.close().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);

        let mut disconnects = 0;
        while let Some(event) = events.try_recv() {
            if event == EngineEvent::Disconnected {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
    }
}
