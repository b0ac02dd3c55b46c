//! Handshakes: single flight, pairing, capacity.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use spendwire::connection::{
    Acquired, ClosedReason, ConnectionError, HandshakeState, Outbound, TransportSignal,
};
use spendwire::events::EventKind;
use spendwire::types::SessionKey;

use crate::support::{
    fast_connection_config, key, record_events, recorded, text, ConnectionRig, Script,
};

#[tokio::test]
async fn concurrent_acquires_share_one_handshake() {
    let rig = Arc::new(ConnectionRig::new().await);
    *rig.transport.connect_delay.lock().expect("delay lock") = Some(Duration::from_millis(50));

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let rig = Arc::clone(&rig);
        tasks.push(tokio::spawn(async move { rig.manager.acquire(&key()).await }));
    }
    for task in tasks {
        let outcome = task.await.expect("task");
        assert!(matches!(outcome, Ok(Acquired::Ready(_))), "{outcome:?}");
    }

    assert_eq!(rig.transport.connect_count(), 1);
    assert_eq!(rig.manager.snapshot().len(), 1);
}

#[tokio::test]
async fn ready_session_is_reused() {
    let rig = ConnectionRig::new().await;
    rig.ready(&key()).await;
    rig.ready(&key()).await;
    assert_eq!(rig.transport.connect_count(), 1);
}

#[tokio::test]
async fn ready_marks_authenticated_and_announces() {
    let rig = ConnectionRig::new().await;
    let ready = record_events(&rig.bus, EventKind::SessionReady);

    rig.ready(&key()).await;

    assert!(rig
        .settings
        .is_authenticated(&key())
        .await
        .expect("flag readable"));
    assert!(crate::support::eventually(|| recorded(&ready).len() == 1).await);
    let events = recorded(&ready);
    assert_eq!(events[0]["session"]["tenant"], "acme");
}

#[tokio::test]
async fn stored_credentials_are_resumed() {
    let rig = ConnectionRig::new().await;
    rig.credentials.seed(&key());
    rig.ready(&key()).await;
    assert_eq!(rig.transport.resumed(), vec![true]);
}

#[tokio::test]
async fn pairing_code_is_returned_then_open_completes() {
    let rig = ConnectionRig::new().await;
    let pairing_events = record_events(&rig.bus, EventKind::SessionPairing);
    rig.transport
        .script(Script::Signals(vec![TransportSignal::PairingCode("ABCD-1234".to_owned())]));

    let before = Utc::now();
    let pairing = match rig.manager.acquire(&key()).await {
        Ok(Acquired::PairingRequired(pairing)) => pairing,
        other => panic!("expected pairing, got {other:?}"),
    };
    assert_eq!(pairing.code, "ABCD-1234");
    assert!(pairing.expires_at > before);
    assert!(!pairing.is_expired(Utc::now()));
    assert_eq!(recorded(&pairing_events)[0]["code"], "ABCD-1234");

    // A second caller sees the same pending code.
    match rig.manager.acquire(&key()).await {
        Ok(Acquired::PairingRequired(again)) => assert_eq!(again, pairing),
        other => panic!("expected pairing, got {other:?}"),
    }

    rig.transport.signal(TransportSignal::Open).await;
    assert!(rig.wait_for_state(&key(), |s| s == Some(HandshakeState::Ready)).await);
    assert_eq!(rig.transport.connect_count(), 1);
}

#[tokio::test]
async fn pairing_expires_and_tears_down() {
    let mut config = fast_connection_config();
    config.pairing_ttl = Duration::from_millis(50);
    let rig = ConnectionRig::with(config).await;
    let closed = record_events(&rig.bus, EventKind::SessionClosed);
    rig.transport
        .script(Script::Signals(vec![TransportSignal::PairingCode("CODE".to_owned())]));

    let outcome = rig.manager.acquire(&key()).await;
    assert!(matches!(outcome, Ok(Acquired::PairingRequired(_))));

    assert!(rig.wait_for_state(&key(), |s| s.is_none()).await);
    assert_eq!(rig.manager.available_slots(), 10);
    let events = recorded(&closed);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["reason"]["reason"], "pairing_expired");
}

#[tokio::test]
async fn rejected_credentials_fail_the_acquire() {
    let rig = ConnectionRig::new().await;
    rig.credentials.seed(&key());
    rig.transport.script(Script::AuthRejected);

    let err = rig.manager.acquire(&key()).await.expect_err("auth rejected");
    assert!(
        matches!(err, ConnectionError::Closed(ClosedReason::AuthInvalid)),
        "{err:?}"
    );
    assert!(!rig.credentials.has(&key()), "bad credentials are purged");
    assert!(rig.manager.state(&key()).is_none());
}

#[tokio::test]
async fn unavailable_bridge_fails_the_handshake() {
    let rig = ConnectionRig::new().await;
    rig.transport.script(Script::Unavailable);

    let err = rig.manager.acquire(&key()).await.expect_err("bridge down");
    assert!(
        matches!(err, ConnectionError::Closed(ClosedReason::HandshakeFailed(_))),
        "{err:?}"
    );
}

#[tokio::test]
async fn silent_transport_times_out() {
    let mut config = fast_connection_config();
    config.handshake_timeout = Duration::from_millis(50);
    let rig = ConnectionRig::with(config).await;
    rig.transport.script(Script::Signals(Vec::new()));

    let err = rig.manager.acquire(&key()).await.expect_err("no signal");
    assert!(
        matches!(err, ConnectionError::Closed(ClosedReason::HandshakeFailed(_))),
        "{err:?}"
    );
    assert!(rig.manager.state(&key()).is_none());
}

#[tokio::test]
async fn handshakes_queue_behind_the_session_cap() {
    let mut config = fast_connection_config();
    config.max_sessions = 1;
    let rig = ConnectionRig::with(config).await;
    let second = SessionKey::new("globex", "+15550002");

    rig.ready(&key()).await;
    assert_eq!(rig.manager.available_slots(), 0);

    let manager = rig.manager.clone();
    let queued = second.clone();
    let waiting = tokio::spawn(async move { manager.acquire(&queued).await });

    // Longer than the handshake budget: queueing must not use it up.
    tokio::time::sleep(Duration::from_millis(1_700)).await;
    assert!(!waiting.is_finished(), "second session must wait for a slot");
    assert_eq!(rig.manager.state(&second), Some(HandshakeState::Queued));
    assert_eq!(rig.transport.connect_count(), 1);

    assert!(rig.manager.teardown(&key()).await);
    match waiting.await.expect("acquire task") {
        Ok(Acquired::Ready(_)) => {}
        other => panic!("expected ready, got {other:?}"),
    }
    assert_eq!(rig.transport.connect_count(), 2);
}

#[test]
fn handshake_timeout_reports_the_configured_budget() {
    let err = ConnectionError::HandshakeTimeout { millis: 1_500 };
    assert_eq!(err.to_string(), "handshake did not complete within 1500ms");
}

#[tokio::test]
async fn inbound_messages_are_published_once_ready() {
    let rig = ConnectionRig::new().await;
    let received = record_events(&rig.bus, EventKind::MessageReceived);
    rig.transport.script(Script::Signals(vec![
        TransportSignal::PairingCode("CODE".to_owned()),
        TransportSignal::Message(text("early", "dropped")),
    ]));

    let _ = rig.manager.acquire(&key()).await;
    rig.transport.signal(TransportSignal::Open).await;
    assert!(rig.wait_for_state(&key(), |s| s == Some(HandshakeState::Ready)).await);

    rig.transport
        .signal(TransportSignal::Message(text("m-1", "expense")))
        .await;
    assert!(crate::support::eventually(|| recorded(&received).len() == 1).await);
    let events = recorded(&received);
    assert_eq!(events[0]["message"]["id"], "m-1");
    assert_eq!(events[0]["session"]["identity"], "+15550001");
}

#[tokio::test]
async fn outbound_requires_a_ready_session() {
    let rig = ConnectionRig::new().await;

    let err = rig
        .manager
        .send_text(&key(), "thread", "hi")
        .await
        .expect_err("no session");
    assert!(matches!(err, ConnectionError::NotReady(_)));

    rig.ready(&key()).await;
    rig.manager
        .send_text(&key(), "thread", "hi")
        .await
        .expect("ready session sends");
    let handle = rig.transport.latest_handle().expect("connected");
    assert_eq!(handle.sent(), vec![("thread".to_owned(), "hi".to_owned())]);
    assert!(!handle.closed.load(Ordering::SeqCst));
}
