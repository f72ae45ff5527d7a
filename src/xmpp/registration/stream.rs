// Raw framed stream for registration (RFC 7395, XMPP over WebSocket)
// No session exists yet, so frames are written and read one element at a time.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use xmpp_parsers::Element;

use crate::error::{EngineError, EngineResult};
use crate::xmpp::stanza;

/// One framed element stream
#[async_trait]
pub trait RawStream: Send {
    async fn send(&mut self, element: &Element) -> EngineResult<()>;

    /// Next top-level element, or None once the peer has closed
    async fn recv(&mut self) -> EngineResult<Option<Element>>;

    /// Send `<close/>` and shut the socket. Safe to call more than once.
    async fn close(&mut self);
}

#[async_trait]
pub trait RawConnector: Send + Sync {
    async fn open(&self, service: &str) -> EngineResult<Box<dyn RawStream>>;
}

/// Opens WebSocket connections negotiating the `xmpp` subprotocol
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl RawConnector for WebSocketConnector {
    async fn open(&self, service: &str) -> EngineResult<Box<dyn RawStream>> {
        let mut request = service
            .into_client_request()
            .map_err(|e| EngineError::Validation(format!("bad service url '{}': {}", service, e)))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("xmpp"));

        debug!("Connecting to WebSocket: {}", service);
        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| EngineError::Transport(format!("WebSocket connect to {} failed: {}", service, e)))?;
        debug!("WebSocket connection established");
        Ok(Box::new(WebSocketRawStream { ws, closed: false }))
    }
}

pub struct WebSocketRawStream {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

#[async_trait]
impl RawStream for WebSocketRawStream {
    async fn send(&mut self, element: &Element) -> EngineResult<()> {
        if self.closed {
            return Err(EngineError::ConnectionClosed);
        }
        let frame = stanza::serialize(element);
        trace!("OUTBOUND FRAME: {}", frame);
        self.ws
            .send(Message::Text(frame))
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> EngineResult<Option<Element>> {
        if self.closed {
            return Ok(None);
        }
        loop {
            let text = match self.ws.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(bytes))) => String::from_utf8(bytes)
                    .map_err(|_| EngineError::Codec("non UTF-8 binary frame".to_string()))?,
                Some(Ok(Message::Close(frame))) => {
                    debug!("WebSocket closed by peer: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(EngineError::Transport(e.to_string())),
                None => return Ok(None),
            };
            if text.trim().is_empty() {
                // Whitespace keepalive
                continue;
            }
            return stanza::parse_frame(&text).map(Some);
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let frame = stanza::serialize(&stanza::framing_close());
        if let Err(e) = self.ws.send(Message::Text(frame)).await {
            debug!("Could not send stream close: {}", e);
        }
        if let Err(e) = self.ws.close(None).await {
            warn!("Error closing WebSocket: {}", e);
        }
    }
}
