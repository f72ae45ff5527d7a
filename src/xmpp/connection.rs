// XMPP connection management
// tokio-xmpp backed Transport. A single link task owns the AsyncClient and
// multiplexes inbound events, outbound stanzas and the keepalive timer, so every
// handle belonging to one connection is torn down together when the task ends.

use async_trait::async_trait;
use futures_util::SinkExt; // For close() on AsyncClient
use futures_util::StreamExt; // For next() on AsyncClient
use log::{debug, error, info, trace, warn};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_xmpp::{AsyncClient as XMPPAsyncClient, BareJid as TokioBareJid, Event as XMPPEvent};
use uuid::Uuid;
use xmpp_parsers::Element;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::xmpp::address::BareAddress;
use crate::xmpp::keepalive::Keepalive;
use crate::xmpp::stanza;
use crate::xmpp::transport::{Connector, Transport, TransportEvent, TransportEvents};

const COMMAND_QUEUE: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Creates tokio-xmpp transports (TCP with STARTTLS, SRV lookup by domain)
#[derive(Debug, Clone, Default)]
pub struct TokioXmppConnector;

impl Connector for TokioXmppConnector {
    fn create(&self, config: &EngineConfig) -> (Arc<dyn Transport>, TransportEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = XmppTransport {
            connect_timeout: config.connect_timeout(),
            keepalive_interval: config.keepalive_interval(),
            events_tx,
            link: TokioMutex::new(None),
            open: Arc::new(AtomicBool::new(false)),
        };
        (Arc::new(transport), events_rx)
    }
}

enum Command {
    Send(Element, oneshot::Sender<EngineResult<()>>),
    Close(oneshot::Sender<()>),
}

struct Link {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

pub struct XmppTransport {
    connect_timeout: Duration,
    keepalive_interval: Duration,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    link: TokioMutex<Option<Link>>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for XmppTransport {
    async fn connect(&self, jid: &BareAddress, password: &str) -> bool {
        let ready_rx = {
            let mut link = self.link.lock().await;
            if link.is_some() {
                debug!("Transport already connected or connecting");
                return self.open.load(Ordering::SeqCst);
            }

            // Parse the JID using tokio-xmpp's BareJid type
            let tokio_jid = match TokioBareJid::from_str(jid.as_str()) {
                Ok(parsed) if parsed.node_str().is_some() => parsed,
                Ok(_) => {
                    error!("Invalid JID format: Missing username part in '{}'", jid);
                    return false;
                }
                Err(e) => {
                    error!("Failed to parse JID '{}': {}", jid, e);
                    return false;
                }
            };

            info!("Connecting to XMPP server as {}", jid);
            let mut client = XMPPAsyncClient::new(tokio_jid, password);
            client.set_reconnect(false);

            let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
            let (ready_tx, ready_rx) = oneshot::channel();
            let task = tokio::spawn(run_link(
                client,
                commands_rx,
                self.events_tx.clone(),
                ready_tx,
                self.keepalive_interval,
                self.open.clone(),
            ));
            // Stored before authentication finishes so disconnect() can stop it
            *link = Some(Link {
                commands: commands_tx,
                task,
            });
            ready_rx
        };

        let failure = match tokio::time::timeout(self.connect_timeout, ready_rx).await {
            Ok(Ok(true)) => return true,
            Ok(_) => {
                warn!("Connection attempt for {} failed", jid);
                "failed"
            }
            Err(_) => {
                error!("Connection timed out after {:?}", self.connect_timeout);
                "timed out"
            }
        };
        if let Some(link) = self.link.lock().await.take() {
            debug!("Dropping link whose connection attempt {}", failure);
            link.task.abort();
        }
        self.open.store(false, Ordering::SeqCst);
        false
    }

    async fn send(&self, stanza: Element) -> EngineResult<()> {
        let commands = {
            let link = self.link.lock().await;
            link.as_ref().map(|link| link.commands.clone())
        }
        .ok_or(EngineError::ConnectionClosed)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(Command::Send(stanza, reply_tx))
            .await
            .map_err(|_| EngineError::ConnectionClosed)?;
        reply_rx.await.map_err(|_| EngineError::ConnectionClosed)?
    }

    async fn disconnect(&self) {
        let Some(link) = self.link.lock().await.take() else {
            debug!("No active connection to disconnect");
            return;
        };
        info!("Disconnecting from XMPP server");

        let (reply_tx, reply_rx) = oneshot::channel();
        if link.commands.send(Command::Close(reply_tx)).await.is_ok() {
            if tokio::time::timeout(CLOSE_GRACE, reply_rx).await.is_err() {
                warn!("Stream close did not complete within {:?}", CLOSE_GRACE);
            }
        }
        link.task.abort();
        self.open.store(false, Ordering::SeqCst);
    }
}

async fn run_link(
    mut client: XMPPAsyncClient,
    mut commands: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    ready_tx: oneshot::Sender<bool>,
    keepalive_interval: Duration,
    open: Arc<AtomicBool>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut online = false;
    // Pings start once the stream is online
    let mut keepalive = Keepalive::disabled();

    loop {
        tokio::select! {
            event = client.next() => match event {
                Some(XMPPEvent::Online { bound_jid, .. }) => {
                    if !online {
                        info!("Connected to XMPP server as {}", bound_jid);
                        online = true;
                        open.store(true, Ordering::SeqCst);
                        keepalive = Keepalive::new(
                            keepalive_interval,
                            format!("keepalive-{}", Uuid::new_v4().simple()),
                        );
                        let _ = events_tx.send(TransportEvent::Opened);
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(true);
                        }
                    } else {
                        debug!("Received additional 'online' event for {}", bound_jid);
                    }
                }
                Some(XMPPEvent::Stanza(stanza)) => {
                    trace!("INBOUND: {}", stanza::serialize(&stanza));
                    let _ = events_tx.send(TransportEvent::StanzaReceived(stanza));
                }
                Some(XMPPEvent::Disconnected(e)) => {
                    log_disconnect_reason(&e);
                    open.store(false, Ordering::SeqCst);
                    match ready_tx.take() {
                        Some(tx) => {
                            let _ = tx.send(false);
                        }
                        None => {
                            let _ = events_tx.send(TransportEvent::TransportError(e.to_string()));
                        }
                    }
                    break;
                }
                None => {
                    info!("XMPP connection closed");
                    open.store(false, Ordering::SeqCst);
                    match ready_tx.take() {
                        Some(tx) => {
                            let _ = tx.send(false);
                        }
                        None => {
                            let _ = events_tx.send(TransportEvent::Closed);
                        }
                    }
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Send(stanza, reply)) => {
                    trace!("OUTBOUND: {}", stanza::serialize(&stanza));
                    let result = client
                        .send_stanza(stanza)
                        .await
                        .map_err(|e| EngineError::Transport(e.to_string()));
                    let _ = reply.send(result);
                }
                Some(Command::Close(reply)) => {
                    match client.send_stanza(stanza::presence_unavailable()).await {
                        Ok(_) => debug!("Sent unavailable presence"),
                        Err(e) => warn!("Failed to send unavailable presence: {}", e),
                    }
                    if let Err(e) = client.close().await {
                        error!("Error closing XMPP stream: {}", e);
                    }
                    open.store(false, Ordering::SeqCst);
                    let _ = events_tx.send(TransportEvent::Closed);
                    let _ = reply.send(());
                    break;
                }
                None => {
                    debug!("Transport handle dropped, ending link");
                    open.store(false, Ordering::SeqCst);
                    break;
                }
            },
            ping = keepalive.next_ping() => {
                // Closing is left to the stream itself
                keepalive.record(client.send_stanza(ping).await);
            }
        }
    }
}

fn log_disconnect_reason(e: &tokio_xmpp::Error) {
    match e {
        tokio_xmpp::Error::Auth(_) => {
            error!("Authentication failed - check username and password");
        }
        tokio_xmpp::Error::Io(io_err) => {
            error!("Network error: {}", io_err);
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused {
                error!("Connection refused - server may be down or not accepting connections");
            } else if io_err.kind() == std::io::ErrorKind::TimedOut {
                error!("Connection timed out - check server address and network connectivity");
            }
        }
        other => {
            error!("XMPP client is disconnected: {:?}", other);
        }
    }
}
