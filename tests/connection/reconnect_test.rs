//! Degraded sessions reconnect with bounded backoff.

use std::time::Duration;

use spendwire::connection::{HandshakeState, ReconnectPolicy, TransportFault, TransportSignal};
use spendwire::events::EventKind;

use crate::support::{eventually, key, record_events, recorded, ConnectionRig, Script};

#[test]
fn backoff_doubles_up_to_the_cap() {
    let policy = ReconnectPolicy {
        max_attempts: 5,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(5),
        attempt_timeout: Duration::from_secs(30),
    };
    assert_eq!(policy.base_delay_for(1), Duration::from_secs(1));
    assert_eq!(policy.base_delay_for(2), Duration::from_secs(2));
    assert_eq!(policy.base_delay_for(3), Duration::from_secs(4));
    assert_eq!(policy.base_delay_for(4), Duration::from_secs(5));
    assert_eq!(policy.base_delay_for(40), Duration::from_secs(5));

    for attempt in 1..=5 {
        let delay = policy.delay_for(attempt);
        let base = policy.base_delay_for(attempt);
        assert!(delay >= base);
        assert!(delay <= base.saturating_add(base / 5), "{delay:?} vs {base:?}");
    }
}

#[tokio::test]
async fn dropped_stream_reconnects_with_stored_credentials() {
    let rig = ConnectionRig::new().await;
    let degraded = record_events(&rig.bus, EventKind::SessionDegraded);
    rig.credentials.seed(&key());
    rig.ready(&key()).await;

    rig.transport.drop_stream();

    assert!(eventually(|| rig.transport.connect_count() == 2).await);
    assert!(rig.wait_for_state(&key(), |s| s == Some(HandshakeState::Ready)).await);
    assert_eq!(rig.transport.resumed(), vec![true, true]);
    assert_eq!(recorded(&degraded).len(), 1);
    let snapshot = rig.manager.snapshot();
    assert_eq!(snapshot[0].reconnect_attempts, 0);
}

#[tokio::test]
async fn transport_fault_triggers_reconnect() {
    let rig = ConnectionRig::new().await;
    rig.credentials.seed(&key());
    rig.ready(&key()).await;

    rig.transport
        .signal(TransportSignal::Error(TransportFault::Transport(
            "stream reset".to_owned(),
        )))
        .await;

    assert!(eventually(|| rig.transport.connect_count() == 2).await);
    assert!(rig.wait_for_state(&key(), |s| s == Some(HandshakeState::Ready)).await);
}

#[tokio::test]
async fn reconnect_gives_up_after_max_attempts() {
    let rig = ConnectionRig::new().await;
    let closed = record_events(&rig.bus, EventKind::SessionClosed);
    rig.credentials.seed(&key());
    rig.ready(&key()).await;
    rig.transport.script(Script::Unavailable);
    rig.transport.script(Script::Unavailable);
    rig.transport.script(Script::Unavailable);

    rig.transport.drop_stream();

    assert!(rig.wait_for_state(&key(), |s| s.is_none()).await);
    // One handshake plus exactly two attempts.
    assert_eq!(rig.transport.connect_count(), 3);
    assert!(!rig.credentials.has(&key()));
    assert!(eventually(|| recorded(&closed).len() == 1).await);
    assert_eq!(recorded(&closed)[0]["reason"]["reason"], "retries_exhausted");
}

#[tokio::test]
async fn revoked_credentials_end_the_reconnect() {
    let rig = ConnectionRig::new().await;
    rig.credentials.seed(&key());
    rig.ready(&key()).await;
    rig.transport.script(Script::AuthRejected);

    rig.transport.drop_stream();

    assert!(rig.wait_for_state(&key(), |s| s.is_none()).await);
    assert_eq!(rig.transport.connect_count(), 2);
    assert!(!rig.credentials.has(&key()));
}

#[tokio::test]
async fn missing_credentials_end_the_reconnect() {
    let rig = ConnectionRig::new().await;
    rig.ready(&key()).await;

    rig.transport.drop_stream();

    assert!(rig.wait_for_state(&key(), |s| s.is_none()).await);
    assert_eq!(rig.transport.connect_count(), 1);
}
