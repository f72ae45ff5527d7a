// Common test utilities for integration tests
// Memory-transport helpers for session tests and a scripted WebSocket server
// for registration tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, LevelFilter};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use xmpp_parsers::Element;

use parley::xmpp::ns;
use parley::xmpp::registration::capability::PayloadShape;
use parley::xmpp::stanza;
use parley::xmpp::transport::memory::{MemoryConnector, MemoryPeer, MemoryPeers};
use parley::xmpp::Subscription;
use parley::{EngineConfig, EngineEvent, XmppEngine};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

pub const WAIT: Duration = Duration::from_secs(2);

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        domain: "localhost".to_string(),
        request_timeout_ms: 1_000,
        keepalive_interval_ms: 0,
        ..EngineConfig::default()
    }
}

/// Engine over the in-memory transport
pub fn memory_engine() -> (XmppEngine, MemoryConnector, MemoryPeers) {
    setup_logging();
    let (connector, peers) = MemoryConnector::new();
    let engine = XmppEngine::new(test_config(), Arc::new(connector.clone()));
    (engine, connector, peers)
}

/// Connect `username` and answer the initial roster fetch with `roster_items`
/// (raw `<item/>` XML).
pub async fn connect_engine(
    engine: &XmppEngine,
    peers: &mut MemoryPeers,
    username: &str,
    roster_items: &str,
) -> MemoryPeer {
    let (connected, peer) = tokio::join!(engine.connect(username, "secret"), async {
        let mut peer = peers.next().await.expect("transport created");
        let presence = peer.next_sent().await.expect("initial presence");
        assert_eq!(presence.name(), "presence");
        let request = peer.next_sent().await.expect("roster request");
        assert!(request.get_child("query", ns::ROSTER).is_some());
        peer.deliver_xml(&format!(
            "<iq xmlns='jabber:client' type='result' id='{}'><query xmlns='jabber:iq:roster'>{}</query></iq>",
            request.attr("id").expect("request id"),
            roster_items
        ))
        .expect("valid roster result");
        peer
    });
    assert!(connected, "engine failed to connect as {}", username);
    peer
}

/// Read the next stanza the engine sends and answer it with an empty result
pub async fn answer_next_iq(peer: &mut MemoryPeer) -> Element {
    let request = peer.next_sent_within(WAIT).await.expect("engine sent an iq");
    assert_eq!(request.name(), "iq");
    peer.deliver(stanza::iq_result_for(&request));
    request
}

/// Wait for the first event matching `predicate`, skipping the rest
pub async fn wait_for_event<F>(events: &mut Subscription, predicate: F) -> Option<EngineEvent>
where
    F: Fn(&EngineEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if predicate(&event) {
                return Some(event);
            }
            debug!("Skipping event {:?}", event);
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Everything currently queued on a subscription
pub fn drain(events: &mut Subscription) -> Vec<EngineEvent> {
    let mut drained = Vec::new();
    while let Some(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

/// How a scripted registration server behaves
#[derive(Clone, Debug)]
pub struct ServerScript {
    /// Accept the socket but never answer
    pub silent: bool,
    pub advertise_register: bool,
    /// Inner XML of the registration form query
    pub form: String,
    /// Shapes the server refuses, with the error condition it answers
    pub reject: Vec<(PayloadShape, &'static str)>,
    /// Hold the registration form back this long
    pub form_delay_ms: u64,
}

pub const PLAIN_FORM: &str = "<instructions>Choose a username and password</instructions><username/><password/>";
pub const DATA_FORM: &str = "<x xmlns='jabber:x:data' type='form'>\
    <field var='FORM_TYPE' type='hidden'><value>jabber:iq:register</value></field>\
    <field var='username' type='text-single'/><field var='password' type='text-private'/></x>";

impl Default for ServerScript {
    fn default() -> Self {
        ServerScript {
            silent: false,
            advertise_register: true,
            form: PLAIN_FORM.to_string(),
            reject: Vec::new(),
            form_delay_ms: 0,
        }
    }
}

/// Scripted XMPP-over-WebSocket server on an ephemeral port
pub struct RegistrationServer {
    pub url: String,
    /// Every registration query submitted, in arrival order
    pub submissions: Arc<Mutex<Vec<Element>>>,
    pub accounts: Arc<Mutex<HashSet<String>>>,
    pub closes: Arc<AtomicUsize>,
    /// Ids of the pings received, in arrival order
    pub pings: Arc<Mutex<Vec<String>>>,
}

impl RegistrationServer {
    pub async fn start(script: ServerScript) -> Self {
        setup_logging();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
        let url = format!("ws://{}/xmpp-websocket", listener.local_addr().expect("local addr"));
        let server = RegistrationServer {
            url,
            submissions: Arc::new(Mutex::new(Vec::new())),
            accounts: Arc::new(Mutex::new(HashSet::new())),
            closes: Arc::new(AtomicUsize::new(0)),
            pings: Arc::new(Mutex::new(Vec::new())),
        };

        let submissions = server.submissions.clone();
        let accounts = server.accounts.clone();
        let closes = server.closes.clone();
        let pings = server.pings.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let script = script.clone();
                let submissions = submissions.clone();
                let accounts = accounts.clone();
                let closes = closes.clone();
                let pings = pings.clone();
                tokio::spawn(async move {
                    serve(socket, script, submissions, accounts, closes, pings).await;
                });
            }
        });
        server
    }

    pub fn config(&self) -> EngineConfig {
        EngineConfig {
            service: self.url.clone(),
            registration_step_timeout_ms: 1_000,
            verify_registration: false,
            ..test_config()
        }
    }

    pub fn submissions(&self) -> Vec<Element> {
        self.submissions.lock().expect("submissions lock").clone()
    }

    pub fn submitted_shapes(&self) -> Vec<PayloadShape> {
        self.submissions().iter().map(shape_of).collect()
    }

    pub fn pings(&self) -> Vec<String> {
        self.pings.lock().expect("pings lock").clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// The client's `<close/>` may land after the client call returns
    pub async fn wait_for_closes(&self, expected: usize) -> bool {
        for _ in 0..50 {
            if self.closes() >= expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

pub fn shape_of(query: &Element) -> PayloadShape {
    if query.get_child("x", ns::DATA_FORMS).is_some() {
        PayloadShape::DataForm
    } else {
        PayloadShape::Plain
    }
}

fn submitted_username(query: &Element) -> Option<String> {
    if let Some(username) = query.get_child("username", ns::REGISTER) {
        return Some(username.text());
    }
    query
        .get_child("x", ns::DATA_FORMS)?
        .children()
        .find(|field| field.attr("var") == Some("username"))
        .and_then(|field| field.children().next())
        .map(|value| value.text())
}

async fn serve(
    socket: tokio::net::TcpStream,
    script: ServerScript,
    submissions: Arc<Mutex<Vec<Element>>>,
    accounts: Arc<Mutex<HashSet<String>>>,
    closes: Arc<AtomicUsize>,
    pings: Arc<Mutex<Vec<String>>>,
) {
    let callback = |_req: &Request, mut resp: Response| {
        resp.headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("xmpp"));
        Ok::<Response, ErrorResponse>(resp)
    };
    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(socket, callback).await else {
        return;
    };

    while let Some(Ok(frame)) = ws.next().await {
        let text = match frame {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let Ok(element) = stanza::parse_frame(&text) else {
            continue;
        };
        if script.silent {
            continue;
        }

        let mut replies = Vec::new();
        if element.is("open", ns::FRAMING) {
            replies.push(
                "<open xmlns='urn:ietf:params:xml:ns:xmpp-framing' from='localhost' id='s1' version='1.0'/>"
                    .to_string(),
            );
            let marker = if script.advertise_register {
                "<register xmlns='http://jabber.org/features/iq-register'/>"
            } else {
                ""
            };
            replies.push(format!(
                "<stream:features xmlns:stream='http://etherx.jabber.org/streams'>\
                 <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>{}\
                 </stream:features>",
                marker
            ));
        } else if element.is("close", ns::FRAMING) {
            closes.fetch_add(1, Ordering::SeqCst);
            let _ = ws
                .send(WsMessage::Text(
                    "<close xmlns='urn:ietf:params:xml:ns:xmpp-framing'/>".to_string(),
                ))
                .await;
            break;
        } else if element.name() == "iq" {
            let id = element.attr("id").unwrap_or_default().to_string();
            let query = element.get_child("query", ns::REGISTER);
            if element.get_child("ping", ns::PING).is_some() {
                pings.lock().expect("pings lock").push(id.clone());
            }
            match (element.attr("type"), query) {
                (Some("get"), Some(_)) => {
                    if script.form_delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(script.form_delay_ms)).await;
                    }
                    replies.push(format!(
                        "<iq type='result' id='{}' from='localhost'><query xmlns='jabber:iq:register'>{}</query></iq>",
                        id, script.form
                    ))
                }
                (Some("set"), Some(query)) => {
                    submissions.lock().expect("submissions lock").push(query.clone());
                    let shape = shape_of(query);
                    let refused = script.reject.iter().find(|(s, _)| *s == shape).map(|(_, c)| *c);
                    let condition = match (refused, submitted_username(query)) {
                        (Some(condition), _) => Some(condition),
                        (None, Some(username)) => {
                            let mut accounts = accounts.lock().expect("accounts lock");
                            if accounts.insert(username) {
                                None
                            } else {
                                Some("conflict")
                            }
                        }
                        (None, None) => Some("bad-request"),
                    };
                    replies.push(match condition {
                        None => format!("<iq type='result' id='{}' from='localhost'/>", id),
                        Some(condition) => format!(
                            "<iq type='error' id='{}' from='localhost'><error type='cancel'>\
                             <{} xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
                            id, condition
                        ),
                    });
                }
                // Heartbeat pings and anything else
                _ => replies.push(format!("<iq type='result' id='{}' from='localhost'/>", id)),
            }
        }

        for reply in replies {
            if ws.send(WsMessage::Text(reply)).await.is_err() {
                return;
            }
        }
    }
}
