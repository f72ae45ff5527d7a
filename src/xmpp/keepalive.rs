// XEP-0199: XMPP Ping, used as a keepalive
// https://xmpp.org/extensions/xep-0199.html
//
// Fixed-period ping schedule shared by the session link and the registration
// stream. The first ping is due one full period after the schedule starts.
// A ping that cannot be sent cancels the schedule; the stream stays open and
// its owner decides what happens next.

use log::debug;
use std::fmt::Display;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use xmpp_parsers::Element;

use crate::xmpp::stanza;

pub struct Keepalive {
    timer: Option<Interval>,
    prefix: String,
    sent: u64,
}

impl Keepalive {
    /// A zero period gives a schedule that never fires
    pub fn new(period: Duration, prefix: impl Into<String>) -> Self {
        let timer = (!period.is_zero()).then(|| {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });
        Keepalive {
            timer,
            prefix: prefix.into(),
            sent: 0,
        }
    }

    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, "")
    }

    pub fn is_active(&self) -> bool {
        self.timer.is_some()
    }

    /// Pings handed out so far
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Wait for the next period and build its ping, each with a fresh id.
    /// Never resolves once cancelled. Safe to use as a `select!` branch.
    pub async fn next_ping(&mut self) -> Element {
        match self.timer.as_mut() {
            Some(timer) => {
                timer.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
        self.sent += 1;
        stanza::ping(&format!("{}-ping{}", self.prefix, self.sent))
    }

    pub fn cancel(&mut self) {
        self.timer = None;
    }

    /// Feed back the outcome of sending a ping
    pub fn record<E: Display>(&mut self, result: Result<(), E>) {
        if let Err(e) = result {
            debug!("Keepalive ping failed, cancelling further pings: {}", e);
            self.cancel();
        }
    }
}
