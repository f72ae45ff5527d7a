// XEP-0077: In-Band Registration
// https://xmpp.org/extensions/xep-0077.html
//
// Raw-stream flow: opening -> awaiting features -> awaiting form -> submitting
// -> verifying -> done, with failed reachable from every state. Each state has
// its own deadline, and the raw stream is closed on every exit path.

use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use xmpp_parsers::Element;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::xmpp::address::BareAddress;
use crate::xmpp::keepalive::Keepalive;
use crate::xmpp::stanza::{self, IqType};
use crate::xmpp::transport::Connector;
use crate::xmpp::{ns, XmppEngine};

pub mod capability;
pub mod stream;

use capability::{plan_submission, PayloadShape, RegistrationForm, StreamFeatures, SubmissionPlan};
use stream::{RawConnector, RawStream};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Opening,
    AwaitingFeatures,
    AwaitingForm,
    Submitting,
    Verifying,
    Done,
    Failed,
}

impl RegistrationState {
    fn describe(self) -> &'static str {
        match self {
            RegistrationState::Opening => "stream open",
            RegistrationState::AwaitingFeatures => "stream features",
            RegistrationState::AwaitingForm => "registration form",
            RegistrationState::Submitting => "registration result",
            RegistrationState::Verifying => "verification",
            RegistrationState::Done => "stream close",
            RegistrationState::Failed => "failure cleanup",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationOutcome {
    pub account: BareAddress,
    /// Shape of the payload the server accepted (or answered with conflict)
    pub shape: PayloadShape,
    /// 1, or 2 when the fallback shape was needed
    pub attempts: u32,
    /// The server reported the account as already existing
    pub already_existed: bool,
    /// Result of the post-registration login, None when verification is off
    pub verified: Option<bool>,
}

/// Validate a username/password pair before any network activity
fn validate(domain: &str, username: &str, password: &str) -> EngineResult<BareAddress> {
    let account = BareAddress::with_default_domain(username, domain)?;
    if account.domain() != domain.to_lowercase() {
        return Err(EngineError::Validation(format!(
            "account {} is not on domain {}",
            account, domain
        )));
    }
    if password.is_empty() {
        return Err(EngineError::Validation("password is empty".to_string()));
    }
    Ok(account)
}

/// Create `username` on the configured domain over a fresh raw stream.
/// A conflict (account exists) counts as success.
pub async fn register_account(
    config: &EngineConfig,
    raw: &dyn RawConnector,
    verifier: &dyn Connector,
    username: &str,
    password: &str,
) -> EngineResult<RegistrationOutcome> {
    let account = validate(&config.domain, username, password)?;
    info!("Attempting to register user {} via {}", account, config.service);

    let step_timeout = config.registration_step_timeout();
    let stream = match timeout(step_timeout, raw.open(&config.service)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            error!("Could not open registration stream: {}", e);
            return Err(e);
        }
        Err(_) => {
            return Err(EngineError::Timeout(
                RegistrationState::Opening.describe().to_string(),
            ))
        }
    };

    let id_prefix = format!("{:08x}", rand::random::<u32>());
    let mut attempt = Attempt {
        stream,
        state: RegistrationState::Opening,
        step_timeout,
        heartbeat: Keepalive::new(config.registration_heartbeat(), id_prefix.as_str()),
        id_prefix,
        counter: 0,
    };

    let result = attempt.run(config, verifier, &account, password).await;
    if let Err(e) = &result {
        warn!("Registration failed in {:?}: {}", attempt.state, e);
        attempt.state = RegistrationState::Failed;
    }
    // Cleanup runs on every exit path
    if timeout(CLOSE_TIMEOUT, attempt.stream.close()).await.is_err() {
        warn!("Registration stream did not close within {:?}", CLOSE_TIMEOUT);
    }

    match &result {
        Ok(outcome) => info!(
            "User {} registered ({}, {} attempt(s){})",
            outcome.account,
            outcome.shape,
            outcome.attempts,
            if outcome.already_existed { ", already existed" } else { "" }
        ),
        Err(e) => error!("Registration of {} failed: {}", account, e),
    }
    result
}

struct Attempt {
    stream: Box<dyn RawStream>,
    state: RegistrationState,
    step_timeout: Duration,
    id_prefix: String,
    counter: u32,
    heartbeat: Keepalive,
}

impl Attempt {
    async fn run(
        &mut self,
        config: &EngineConfig,
        verifier: &dyn Connector,
        account: &BareAddress,
        password: &str,
    ) -> EngineResult<RegistrationOutcome> {
        self.send(&stanza::framing_open(&config.domain)).await?;

        self.state = RegistrationState::AwaitingFeatures;
        let features = self.wait_for(|el| el.name() == "features").await?;
        let features = StreamFeatures::from_element(&features);
        if !features.supports_registration() {
            return Err(EngineError::Capability(
                "server does not support in-band registration".to_string(),
            ));
        }
        debug!("Server features: {:?}", features);

        self.state = RegistrationState::AwaitingForm;
        let form_id = self.next_id();
        let request = stanza::iq(
            IqType::Get,
            &form_id,
            Some(&config.domain),
            Some(Element::builder("query", ns::REGISTER).build()),
        );
        self.send(&request).await?;
        let response = self.expect_response(&form_id).await?;
        let form = parse_form(&response)?;
        let plan = plan_submission(&form)?;
        debug!("Registration form {:?}, submitting {} first", form, plan.first);

        self.state = RegistrationState::Submitting;
        let (shape, attempts, already_existed) = self
            .submit(plan, &config.domain, account.local_part(), password)
            .await?;

        let verified = if config.verify_registration {
            self.state = RegistrationState::Verifying;
            Some(verify(config, verifier, account, password).await)
        } else {
            None
        };

        self.state = RegistrationState::Done;
        Ok(RegistrationOutcome {
            account: account.clone(),
            shape,
            attempts,
            already_existed,
            verified,
        })
    }

    /// Submit in the planned shape; on a non-conflict error retry exactly once
    /// with the other shape.
    async fn submit(
        &mut self,
        plan: SubmissionPlan,
        domain: &str,
        username: &str,
        password: &str,
    ) -> EngineResult<(PayloadShape, u32, bool)> {
        let mut last_error = None;
        for (attempt, shape) in [plan.first, plan.fallback].into_iter().enumerate() {
            let attempts = attempt as u32 + 1;
            let id = self.next_id();
            let submit = stanza::iq(
                IqType::Set,
                &id,
                Some(domain),
                Some(shape.build_query(username, password)),
            );
            info!("Sending {} registration (attempt {})", shape, attempts);
            self.send(&submit).await?;

            match self.expect_response(&id).await {
                Ok(_) => return Ok((shape, attempts, false)),
                Err(e) if e.is_conflict() => {
                    info!("Account {} already exists", username);
                    return Ok((shape, attempts, true));
                }
                Err(e @ EngineError::Protocol { .. }) => {
                    warn!("Registration with {} rejected: {}", shape, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| EngineError::Protocol {
            condition: "undefined-condition".to_string(),
            error_type: None,
            text: None,
        }))
    }

    /// Write one frame within the current state's deadline
    async fn send(&mut self, element: &Element) -> EngineResult<()> {
        match timeout(self.step_timeout, self.stream.send(element)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Registration timed out sending during {}", self.state.describe());
                Err(EngineError::Timeout(self.state.describe().to_string()))
            }
        }
    }

    fn next_id(&mut self) -> String {
        self.counter += 1;
        format!("{}-reg{}", self.id_prefix, self.counter)
    }

    /// Wait for the iq answering `id`; error responses become protocol errors
    async fn expect_response(&mut self, id: &str) -> EngineResult<Element> {
        let response = self
            .wait_for(|el| {
                el.name() == "iq"
                    && el.attr("id") == Some(id)
                    && matches!(stanza::iq_type(el), Some(IqType::Result) | Some(IqType::Error))
            })
            .await?;
        match stanza::iq_type(&response) {
            Some(IqType::Error) => Err(stanza::stanza_error(&response)),
            _ => Ok(response),
        }
    }

    /// Read frames until one satisfies `wanted`, within the current state's
    /// deadline. Pings the server while waiting.
    async fn wait_for<F>(&mut self, wanted: F) -> EngineResult<Element>
    where
        F: Fn(&Element) -> bool,
    {
        let deadline = sleep(self.step_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!("Registration timed out waiting for {}", self.state.describe());
                    return Err(EngineError::Timeout(self.state.describe().to_string()));
                }
                ping = self.heartbeat.next_ping() => {
                    let result = self.send(&ping).await;
                    self.heartbeat.record(result);
                }
                frame = self.stream.recv() => {
                    let Some(element) = frame? else {
                        return Err(EngineError::Transport(format!(
                            "server closed the stream while waiting for {}",
                            self.state.describe()
                        )));
                    };
                    if element.is("close", ns::FRAMING) {
                        return Err(EngineError::Transport("server closed the stream".to_string()));
                    }
                    if element.is("error", ns::STREAMS) {
                        let condition = element
                            .children()
                            .next()
                            .map(|c| c.name().to_string())
                            .unwrap_or_else(|| "undefined-condition".to_string());
                        return Err(EngineError::Transport(format!("stream error: {}", condition)));
                    }
                    if wanted(&element) {
                        return Ok(element);
                    }
                    debug!("Skipping <{}> while waiting for {}", element.name(), self.state.describe());
                }
            }
        }
    }
}

fn parse_form(response: &Element) -> EngineResult<RegistrationForm> {
    response
        .get_child("query", ns::REGISTER)
        .map(RegistrationForm::from_query)
        .ok_or_else(|| EngineError::Capability("registration form response carries no query".to_string()))
}

/// Log in with the new credentials. Diagnostic only.
async fn verify(
    config: &EngineConfig,
    connector: &dyn Connector,
    account: &BareAddress,
    password: &str,
) -> bool {
    info!("Verifying registration by authenticating as {}", account);
    let (transport, _events) = connector.create(config);
    let ok = timeout(config.verify_timeout(), transport.connect(account, password))
        .await
        .unwrap_or(false);
    if timeout(config.verify_timeout(), transport.disconnect()).await.is_err() {
        warn!("Verification session for {} did not close within {:?}", account, config.verify_timeout());
    }
    if ok {
        info!("Authentication successful, {} was created properly", account);
    } else {
        warn!("User {} was registered but verification failed", account);
    }
    ok
}

impl XmppEngine {
    /// Register an account through the live session, e.g. when provisioning
    /// users from an administrative login. A conflict counts as success.
    pub async fn register_via_session(&self, username: &str, password: &str) -> EngineResult<RegistrationOutcome> {
        let account = validate(&self.config.domain, username, password)?;
        let session = self.online_session()?;

        info!("Requesting registration form for {} over the session", account);
        let form_request = stanza::iq(
            IqType::Get,
            &session.next_id(),
            None,
            Some(Element::builder("query", ns::REGISTER).build()),
        );
        let response = session.request(form_request).await?;
        let plan = plan_submission(&parse_form(&response)?)?;

        let mut last_error = None;
        for (attempt, shape) in [plan.first, plan.fallback].into_iter().enumerate() {
            let attempts = attempt as u32 + 1;
            let submit = stanza::iq(
                IqType::Set,
                &session.next_id(),
                None,
                Some(shape.build_query(account.local_part(), password)),
            );
            match session.request(submit).await {
                Ok(_) => {
                    info!("User {} created via session", account);
                    return Ok(RegistrationOutcome {
                        account,
                        shape,
                        attempts,
                        already_existed: false,
                        verified: None,
                    });
                }
                Err(e) if e.is_conflict() => {
                    info!("User {} already exists", account);
                    return Ok(RegistrationOutcome {
                        account,
                        shape,
                        attempts,
                        already_existed: true,
                        verified: None,
                    });
                }
                Err(e @ EngineError::Protocol { .. }) => {
                    warn!("Session registration with {} rejected: {}", shape, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| EngineError::Capability("registration rejected".to_string())))
    }
}
