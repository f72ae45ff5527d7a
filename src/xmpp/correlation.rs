// Request/response correlation over the stanza stream
// Every outstanding iq gets a waiter keyed by its id. The first matching
// response wins; late or duplicate answers find no waiter and fall through.

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use xmpp_parsers::Element;

use crate::error::{EngineError, EngineResult};
use crate::xmpp::stanza::{self, IqType};
use crate::xmpp::transport::Transport;

struct PendingRequest {
    /// Bare form of the request's `to`, if it had one
    expected_from: Option<String>,
    /// Tells a reused explicit id apart from the request that first held it
    ticket: u64,
    waiter: oneshot::Sender<EngineResult<Element>>,
}

struct Registry {
    prefix: String,
    counter: AtomicU64,
    tickets: AtomicU64,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

/// Drops the registry entry when the requesting future goes away first
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: String,
    ticket: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.correlator.remove_ticket(&self.id, self.ticket) {
            debug!("Released pending request {}", self.id);
        }
    }
}

/// Correlation layer for one session. Cheap to clone.
#[derive(Clone)]
pub struct Correlator {
    registry: Arc<Registry>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

fn bare(address: &str) -> String {
    address.split('/').next().unwrap_or(address).to_lowercase()
}

impl Correlator {
    pub fn new() -> Self {
        Correlator {
            registry: Arc::new(Registry {
                prefix: format!("{:08x}", rand::random::<u32>()),
                counter: AtomicU64::new(1),
                tickets: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Session-scoped id: random prefix plus a monotonic counter
    pub fn next_id(&self) -> String {
        let n = self.registry.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.registry.prefix, n)
    }

    pub fn pending_count(&self) -> usize {
        self.registry.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.registry
            .pending
            .lock()
            .map(|p| p.contains_key(id))
            .unwrap_or(false)
    }

    fn register(&self, stanza: &mut Element) -> EngineResult<(PendingGuard<'_>, oneshot::Receiver<EngineResult<Element>>)> {
        let mut pending = self
            .registry
            .pending
            .lock()
            .map_err(|_| EngineError::Transport("correlation registry poisoned".to_string()))?;

        let id = match stanza.attr("id") {
            Some(id) if pending.contains_key(id) => {
                return Err(EngineError::Validation(format!("request id '{}' already pending", id)));
            }
            Some(id) => id.to_string(),
            None => {
                let mut id = self.next_id();
                while pending.contains_key(&id) {
                    id = self.next_id();
                }
                stanza.set_attr("id", id.as_str());
                id
            }
        };

        let ticket = self.registry.tickets.fetch_add(1, Ordering::Relaxed);
        let (waiter, rx) = oneshot::channel();
        pending.insert(
            id.clone(),
            PendingRequest {
                expected_from: stanza.attr("to").map(bare),
                ticket,
                waiter,
            },
        );
        let guard = PendingGuard {
            correlator: self,
            id,
            ticket,
        };
        Ok((guard, rx))
    }

    /// Remove `id` only while it still belongs to the request holding `ticket`
    fn remove_ticket(&self, id: &str, ticket: u64) -> bool {
        let Ok(mut pending) = self.registry.pending.lock() else {
            return false;
        };
        if pending.get(id).map(|entry| entry.ticket) == Some(ticket) {
            pending.remove(id);
            return true;
        }
        false
    }

    /// Send `stanza` and wait for the response carrying its id. Assigns an id
    /// when the stanza has none. An error-typed response becomes a protocol error.
    /// The entry is gone once this returns or is dropped, whichever comes first.
    pub async fn request(
        &self,
        transport: &dyn Transport,
        mut stanza: Element,
        timeout: Duration,
    ) -> EngineResult<Element> {
        let (guard, rx) = self.register(&mut stanza)?;
        debug!("Sending correlated request {} ({})", guard.id, stanza.name());

        transport.send(stanza).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::ConnectionClosed),
            Err(_) => {
                warn!("Request {} timed out after {:?}", guard.id, timeout);
                Err(EngineError::Timeout(format!("response to request {}", guard.id)))
            }
        }
    }

    /// Offer an inbound stanza. Returns true when it answered a pending request.
    pub fn resolve(&self, stanza: &Element) -> bool {
        let outcome = match stanza::iq_type(stanza) {
            Some(IqType::Result) => None,
            Some(IqType::Error) => Some(stanza::stanza_error(stanza)),
            _ => return false,
        };
        let Some(id) = stanza.attr("id") else {
            return false;
        };

        let entry = {
            let Ok(mut pending) = self.registry.pending.lock() else {
                return false;
            };
            let matches = match pending.get(id) {
                Some(entry) => match (&entry.expected_from, stanza.attr("from")) {
                    (Some(expected), Some(from)) => *expected == bare(from),
                    _ => true,
                },
                None => false,
            };
            if !matches {
                return false;
            }
            pending.remove(id)
        };

        if let Some(entry) = entry {
            let result = match outcome {
                Some(err) => Err(err),
                None => Ok(stanza.clone()),
            };
            if entry.waiter.send(result).is_err() {
                debug!("Requester for {} went away before its response", id);
            }
            return true;
        }
        false
    }

    /// Fail every outstanding request, e.g. when the connection goes away.
    pub fn fail_all(&self, error: EngineError) {
        let drained: Vec<(String, PendingRequest)> = match self.registry.pending.lock() {
            Ok(mut pending) => pending.drain().collect(),
            Err(_) => return,
        };
        if !drained.is_empty() {
            debug!("Failing {} pending requests: {}", drained.len(), error);
        }
        for (_, entry) in drained {
            let _ = entry.waiter.send(Err(error.clone()));
        }
    }
}
