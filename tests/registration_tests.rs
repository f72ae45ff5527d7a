// Registration against a scripted XMPP-over-WebSocket server
mod common;

use std::sync::Arc;

use common::{RegistrationServer, ServerScript, DATA_FORM, PLAIN_FORM};
use parley::xmpp::ns;
use parley::xmpp::registration::capability::PayloadShape;
use parley::xmpp::transport::memory::MemoryConnector;
use parley::{BareAddress, EngineError, ErrorKind, XmppEngine};

fn engine_for(server: &RegistrationServer) -> XmppEngine {
    XmppEngine::with_config(server.config())
}

#[tokio::test]
async fn test_plain_form_registration_succeeds() {
    let server = RegistrationServer::start(ServerScript::default()).await;
    let engine = engine_for(&server);

    let outcome = engine.register_account("newuser", "s3cret").await.unwrap();
    assert_eq!(outcome.account.as_str(), "newuser@localhost");
    assert_eq!(outcome.shape, PayloadShape::Plain);
    assert_eq!(outcome.attempts, 1);
    assert!(!outcome.already_existed);
    assert_eq!(outcome.verified, None);

    let submissions = server.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].get_child("username", ns::REGISTER).unwrap().text(), "newuser");
    assert_eq!(submissions[0].get_child("password", ns::REGISTER).unwrap().text(), "s3cret");
    assert!(server.wait_for_closes(1).await, "client never sent <close/>");
}

#[tokio::test]
async fn test_existing_account_counts_as_success() {
    let server = RegistrationServer::start(ServerScript::default()).await;
    let engine = engine_for(&server);

    let first = engine.register_account("dupe", "pw").await.unwrap();
    assert!(!first.already_existed);

    let second = engine.register_account("dupe", "pw").await.unwrap();
    assert!(second.already_existed);
    // Conflict is final, no fallback attempt
    assert_eq!(second.attempts, 1);
    assert_eq!(server.submissions().len(), 2);
}

#[tokio::test]
async fn test_data_form_preferred() {
    let script = ServerScript {
        form: format!("{}{}", PLAIN_FORM, DATA_FORM),
        ..ServerScript::default()
    };
    let server = RegistrationServer::start(script).await;
    let engine = engine_for(&server);

    let outcome = engine.register_account("formuser", "pw").await.unwrap();
    assert_eq!(outcome.shape, PayloadShape::DataForm);
    assert_eq!(server.submitted_shapes(), vec![PayloadShape::DataForm]);

    let form = server.submissions()[0].get_child("x", ns::DATA_FORMS).unwrap().clone();
    assert_eq!(form.attr("type"), Some("submit"));
}

#[tokio::test]
async fn test_generic_error_retries_other_shape_once() {
    let script = ServerScript {
        form: DATA_FORM.to_string(),
        reject: vec![(PayloadShape::DataForm, "not-acceptable")],
        ..ServerScript::default()
    };
    let server = RegistrationServer::start(script).await;
    let engine = engine_for(&server);

    let outcome = engine.register_account("retry", "pw").await.unwrap();
    assert_eq!(outcome.shape, PayloadShape::Plain);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(
        server.submitted_shapes(),
        vec![PayloadShape::DataForm, PayloadShape::Plain]
    );
}

#[tokio::test]
async fn test_both_shapes_rejected_fails_after_one_fallback() {
    let script = ServerScript {
        reject: vec![
            (PayloadShape::Plain, "not-allowed"),
            (PayloadShape::DataForm, "not-allowed"),
        ],
        ..ServerScript::default()
    };
    let server = RegistrationServer::start(script).await;
    let engine = engine_for(&server);

    let err = engine.register_account("nobody", "pw").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(err.condition(), Some("not-allowed"));
    assert_eq!(server.submissions().len(), 2);
    assert!(server.wait_for_closes(1).await);
}

#[tokio::test]
async fn test_missing_register_feature_is_capability_error() {
    let script = ServerScript {
        advertise_register: false,
        ..ServerScript::default()
    };
    let server = RegistrationServer::start(script).await;
    let engine = engine_for(&server);

    let err = engine.register_account("someone", "pw").await.unwrap_err();
    assert!(matches!(err, EngineError::Capability(_)));
    assert!(server.submissions().is_empty());
    assert!(server.wait_for_closes(1).await);
}

#[tokio::test]
async fn test_unusable_form_is_capability_error() {
    let script = ServerScript {
        form: "<instructions>Visit our website</instructions><email/>".to_string(),
        ..ServerScript::default()
    };
    let server = RegistrationServer::start(script).await;
    let engine = engine_for(&server);

    let err = engine.register_account("someone", "pw").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
    assert!(server.submissions().is_empty());
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let script = ServerScript {
        silent: true,
        ..ServerScript::default()
    };
    let server = RegistrationServer::start(script).await;
    let mut config = server.config();
    config.registration_step_timeout_ms = 200;
    let engine = XmppEngine::with_config(config);

    let started = std::time::Instant::now();
    let err = engine.register_account("waiting", "pw").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() < std::time::Duration::from_secs(3));
}

#[tokio::test]
async fn test_heartbeat_keeps_slow_server_company() {
    let script = ServerScript {
        form_delay_ms: 400,
        ..ServerScript::default()
    };
    let server = RegistrationServer::start(script).await;
    let mut config = server.config();
    config.registration_heartbeat_ms = 100;
    let engine = XmppEngine::with_config(config);

    let outcome = engine.register_account("patient", "pw").await.unwrap();
    assert_eq!(outcome.attempts, 1);
    assert!(server.wait_for_closes(1).await);

    // Pings queued behind the slow form are read before the close
    let pings = server.pings();
    assert!(pings.len() >= 2, "pings: {:?}", pings);
    let mut unique = pings.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), pings.len(), "ping ids repeat: {:?}", pings);
}

#[tokio::test]
async fn test_invalid_input_rejected_before_network() {
    let server = RegistrationServer::start(ServerScript::default()).await;
    let engine = engine_for(&server);

    for (username, password) in [("", "pw"), ("alice", ""), ("alice@other.example", "pw")] {
        let err = engine.register_account(username, password).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "{:?}", (username, password));
    }
    assert!(server.submissions().is_empty());
    assert_eq!(server.closes(), 0);
}

#[tokio::test]
async fn test_unreachable_service_is_transport_error() {
    // Bind then drop to get a port nobody listens on
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut config = common::test_config();
    config.service = format!("ws://127.0.0.1:{}/xmpp-websocket", port);
    let engine = XmppEngine::with_config(config);

    let err = engine.register_account("alice", "pw").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn test_verification_uses_new_credentials() {
    let server = RegistrationServer::start(ServerScript::default()).await;
    let mut config = server.config();
    config.verify_registration = true;

    let (connector, _peers) = MemoryConnector::new();
    let account = BareAddress::parse("verified@localhost").unwrap();
    connector.add_account(&account, "right");
    let engine = XmppEngine::new(config, Arc::new(connector));

    let outcome = engine.register_account("verified", "right").await.unwrap();
    assert_eq!(outcome.verified, Some(true));

    // A failed login after registration is reported, not raised
    let outcome = engine.register_account("verified", "wrong").await.unwrap();
    assert!(outcome.already_existed);
    assert_eq!(outcome.verified, Some(false));
}
