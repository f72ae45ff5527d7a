// Engine error taxonomy
// Every library operation reports one of these; the UI layer sees the coarse ErrorKind.

use serde::Serialize;
use thiserror::Error;

/// Coarse classification surfaced to the UI through `EngineEvent::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Stream-level failure, unrecoverable for the current session
    Transport,
    /// No response within the deadline, retryable by the caller
    Timeout,
    /// The server answered with an explicit error stanza
    Protocol,
    /// The server lacks a feature we need
    Capability,
    /// Malformed caller input, rejected before any network activity
    Validation,
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Server returned error '{condition}'{}", text.as_ref().map(|t| format!(": {}", t)).unwrap_or_default())]
    Protocol {
        condition: String,
        error_type: Option<String>,
        text: Option<String>,
    },

    #[error("Unsupported by server: {0}")]
    Capability(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Malformed stanza: {0}")]
    Codec(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Transport(_) | EngineError::ConnectionClosed => ErrorKind::Transport,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::Protocol { .. } | EngineError::Codec(_) => ErrorKind::Protocol,
            EngineError::Capability(_) => ErrorKind::Capability,
            EngineError::Validation(_) | EngineError::NotConnected => ErrorKind::Validation,
        }
    }

    /// Server-side defined condition, if this is a protocol error
    pub fn condition(&self) -> Option<&str> {
        match self {
            EngineError::Protocol { condition, .. } => Some(condition),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.condition() == Some("conflict")
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
