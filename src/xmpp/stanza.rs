// Stanza codec
// Builds the outbound elements the engine needs, classifies inbound ones and
// handles RFC 7395 WebSocket frames for the raw registration stream.

use log::trace;
use std::borrow::Cow;
use xmpp_parsers::Element;

use crate::error::EngineError;
use crate::xmpp::address::BareAddress;
use crate::xmpp::ns;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    pub fn from_attr(value: &str) -> Option<Self> {
        match value {
            "get" => Some(IqType::Get),
            "set" => Some(IqType::Set),
            "result" => Some(IqType::Result),
            "error" => Some(IqType::Error),
            _ => None,
        }
    }
}

/// An inbound chat message reduced to what the engine stores
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub from: BareAddress,
    pub id: Option<String>,
    pub body: String,
}

/// Result of classifying one inbound stanza
#[derive(Debug, Clone)]
pub enum InboundStanza {
    Message(ChatMessage),
    Presence(Element),
    /// A roster query carried by an iq of type set (push) or result (fetch)
    RosterPush(Element),
    Iq(Element),
    Unknown,
}

/// Build `<name xmlns=namespace>text</name>`
pub fn text_element(name: &str, namespace: &str, text: &str) -> Element {
    let mut element = Element::builder(name, namespace).build();
    element.append_text_node(text);
    element
}

pub fn iq(kind: IqType, id: &str, to: Option<&str>, payload: Option<Element>) -> Element {
    let mut builder = Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", kind.as_str())
        .attr("id", id);
    if let Some(to) = to {
        builder = builder.attr("to", to);
    }
    if let Some(payload) = payload {
        builder = builder.append(payload);
    }
    builder.build()
}

pub fn chat_message(to: &BareAddress, id: &str, body: &str) -> Element {
    Element::builder("message", ns::JABBER_CLIENT)
        .attr("type", "chat")
        .attr("to", to.as_str())
        .attr("id", id)
        .append(text_element("body", ns::JABBER_CLIENT, body))
        .build()
}

/// Initial or updated presence; `show` is one of away/xa/dnd/chat
pub fn presence(show: Option<&str>) -> Element {
    let mut element = Element::builder("presence", ns::JABBER_CLIENT).build();
    if let Some(show) = show {
        element.append_child(text_element("show", ns::JABBER_CLIENT, show));
    }
    element
}

pub fn presence_unavailable() -> Element {
    Element::builder("presence", ns::JABBER_CLIENT)
        .attr("type", "unavailable")
        .build()
}

/// Directed presence such as subscribe/subscribed/unsubscribe
pub fn presence_to(to: &BareAddress, kind: &str) -> Element {
    Element::builder("presence", ns::JABBER_CLIENT)
        .attr("to", to.as_str())
        .attr("type", kind)
        .build()
}

pub fn roster_query() -> Element {
    Element::builder("query", ns::ROSTER).build()
}

pub fn roster_item(jid: &BareAddress, name: Option<&str>, remove: bool) -> Element {
    let mut item = Element::builder("item", ns::ROSTER).attr("jid", jid.as_str());
    if let Some(name) = name {
        item = item.attr("name", name);
    }
    if remove {
        item = item.attr("subscription", "remove");
    }
    Element::builder("query", ns::ROSTER).append(item.build()).build()
}

pub fn ping(id: &str) -> Element {
    iq(IqType::Get, id, None, Some(Element::builder("ping", ns::PING).build()))
}

pub fn read_receipt(to: &BareAddress, id: &str, message_id: &str) -> Element {
    Element::builder("message", ns::JABBER_CLIENT)
        .attr("to", to.as_str())
        .attr("id", id)
        .append(
            Element::builder("received", ns::RECEIPTS)
                .attr("id", message_id)
                .build(),
        )
        .build()
}

/// Empty result answering `request`, addressed back to its sender
pub fn iq_result_for(request: &Element) -> Element {
    let id = request.attr("id").unwrap_or_default();
    iq(IqType::Result, id, request.attr("from"), None)
}

/// Error reply to an iq we cannot serve, carrying a cancel-type condition
pub fn iq_error_for(request: &Element, condition: &str) -> Element {
    let id = request.attr("id").unwrap_or_default();
    let error = Element::builder("error", ns::JABBER_CLIENT)
        .attr("type", "cancel")
        .append(Element::builder(condition, ns::STANZAS).build())
        .build();
    iq(IqType::Error, id, request.attr("from"), Some(error))
}

pub fn iq_type(stanza: &Element) -> Option<IqType> {
    if stanza.name() != "iq" {
        return None;
    }
    stanza.attr("type").and_then(IqType::from_attr)
}

/// Turn an error stanza into a protocol error carrying the server's condition.
pub fn stanza_error(stanza: &Element) -> EngineError {
    let error = stanza.children().find(|child| child.name() == "error");
    let Some(error) = error else {
        return EngineError::Protocol {
            condition: "undefined-condition".to_string(),
            error_type: None,
            text: None,
        };
    };

    let condition = error
        .children()
        .find(|child| child.ns() == ns::STANZAS && child.name() != "text")
        .map(|child| child.name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string());
    let text = error
        .children()
        .find(|child| child.name() == "text")
        .map(|child| child.text())
        .filter(|text| !text.is_empty());

    EngineError::Protocol {
        condition,
        error_type: error.attr("type").map(|s| s.to_string()),
        text,
    }
}

/// Classify an inbound stanza for dispatch.
pub fn classify(stanza: &Element) -> InboundStanza {
    match stanza.name() {
        "message" => classify_message(stanza),
        "presence" => InboundStanza::Presence(stanza.clone()),
        "iq" => {
            let carries_roster = stanza.get_child("query", ns::ROSTER).is_some();
            match iq_type(stanza) {
                Some(IqType::Set) | Some(IqType::Result) if carries_roster => {
                    InboundStanza::RosterPush(stanza.clone())
                }
                Some(_) => InboundStanza::Iq(stanza.clone()),
                None => InboundStanza::Unknown,
            }
        }
        _ => InboundStanza::Unknown,
    }
}

fn classify_message(stanza: &Element) -> InboundStanza {
    // Only one-to-one chat; groupchat, headline and error messages are dropped
    match stanza.attr("type") {
        None | Some("chat") | Some("normal") => {}
        _ => return InboundStanza::Unknown,
    }
    let Some(from) = stanza.attr("from").and_then(|from| BareAddress::parse(from).ok()) else {
        return InboundStanza::Unknown;
    };
    let body = stanza
        .children()
        .find(|child| child.name() == "body")
        .map(|body| body.text())
        .unwrap_or_default();
    if body.is_empty() {
        // Chat states, receipts and similar carry no body
        return InboundStanza::Unknown;
    }
    InboundStanza::Message(ChatMessage {
        from,
        id: stanza.attr("id").map(|s| s.to_string()),
        body,
    })
}

pub fn serialize(stanza: &Element) -> String {
    let mut buf = Vec::new();
    if let Err(e) = stanza.write_to(&mut buf) {
        // Writing into a Vec only fails on malformed names
        log::error!("Failed to serialize stanza '{}': {}", stanza.name(), e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// RFC 7395 `<open/>` frame
pub fn framing_open(domain: &str) -> Element {
    Element::builder("open", ns::FRAMING)
        .attr("to", domain)
        .attr("version", "1.0")
        .build()
}

/// RFC 7395 `<close/>` frame
pub fn framing_close() -> Element {
    Element::builder("close", ns::FRAMING).build()
}

/// Normalize one WebSocket text frame so it parses as a standalone document.
/// Drops a leading XML declaration, rewrites `stream:` prefixed roots that rely
/// on an undeclared prefix, and gives an un-namespaced root `jabber:client`.
pub fn normalize_frame(text: &str) -> Cow<'_, str> {
    let mut frame = text.trim();
    if frame.starts_with("<?xml") {
        if let Some(pos) = frame.find("?>") {
            frame = frame[pos + 2..].trim_start();
        }
    }

    let root_end = frame.find('>').unwrap_or(frame.len());
    let root_tag = &frame[..root_end];

    if frame.starts_with("<stream:") && !root_tag.contains("xmlns:stream") {
        let stripped = frame.replace("<stream:", "<").replace("</stream:", "</");
        return Cow::Owned(inject_xmlns(&stripped, ns::STREAMS));
    }

    if !root_tag.contains("xmlns=") && !root_tag.contains("xmlns:") {
        return Cow::Owned(inject_xmlns(frame, ns::JABBER_CLIENT));
    }

    Cow::Borrowed(frame)
}

fn inject_xmlns(frame: &str, namespace: &str) -> String {
    let Some(pos) = frame[1..].find([' ', '>', '/']).map(|p| p + 1) else {
        return frame.to_string();
    };
    let mut rewritten = String::with_capacity(frame.len() + namespace.len() + 10);
    rewritten.push_str(&frame[..pos]);
    rewritten.push_str(&format!(" xmlns='{}'", namespace));
    rewritten.push_str(&frame[pos..]);
    rewritten
}

pub fn parse_frame(text: &str) -> Result<Element, EngineError> {
    let normalized = normalize_frame(text);
    trace!("INBOUND FRAME: {}", normalized);
    normalized
        .parse::<Element>()
        .map_err(|e| EngineError::Codec(format!("{}: {}", e, text.trim())))
}
