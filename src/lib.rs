// Re-export modules for the binary and the integration tests
pub mod config;
pub mod error;
pub mod models;
pub mod utils;
pub mod xmpp;

// Re-export main types for convenience
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult, ErrorKind};
pub use models::*;
pub use xmpp::{BareAddress, EngineEvent, XmppEngine};
