//! Teardown, logout, sweeps, restore, and shutdown.

use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;

use spendwire::connection::{Acquired, CloseReason, ClosedReason, HandshakeState, TransportSignal};
use spendwire::credentials::AuthMaterial;
use spendwire::events::EventKind;
use spendwire::service::Service;
use spendwire::store::dedup::{Duplicate, Marker};
use spendwire::store::{ConversationState, ThreadFlow};
use spendwire::types::default_questions;

use crate::support::{
    eventually, fast_connection_config, key, record_events, recorded, ConnectionRig, Script,
};

fn later(seconds: i64) -> chrono::DateTime<Utc> {
    Utc::now()
        .checked_add_signed(chrono::Duration::seconds(seconds))
        .expect("in range")
}

#[tokio::test]
async fn teardown_releases_everything_but_credentials() {
    let rig = ConnectionRig::new().await;
    rig.credentials.seed(&key());
    rig.ready(&key()).await;
    rig.state
        .start_flow(
            &key(),
            "thread",
            ThreadFlow::Collecting(ConversationState::new(
                "m-0",
                default_questions(),
                None,
                Utc::now(),
            )),
        )
        .expect("flow starts");
    assert_eq!(rig.manager.available_slots(), 9);

    assert!(rig.manager.teardown(&key()).await);

    assert!(rig.manager.state(&key()).is_none());
    assert_eq!(rig.manager.available_slots(), 10);
    assert_eq!(rig.state.active_flows(), 0);
    assert!(rig.credentials.has(&key()));
    assert!(!rig.settings.is_authenticated(&key()).await.expect("flag"));
    let handle = rig.transport.latest_handle().expect("connected");
    assert!(handle.closed.load(Ordering::SeqCst));

    // Idempotent.
    assert!(!rig.manager.teardown(&key()).await);
}

#[tokio::test]
async fn dedup_markers_outlive_a_teardown() {
    let rig = ConnectionRig::new().await;
    rig.credentials.seed(&key());
    rig.ready(&key()).await;
    rig.state.begin_message(&key(), "abc123").expect("new id");
    rig.state.complete_message(&key(), "abc123");

    assert!(rig.manager.teardown(&key()).await);
    rig.ready(&key()).await;

    assert_eq!(
        rig.state.begin_message(&key(), "abc123"),
        Err(Duplicate(Marker::Processed))
    );
}

#[tokio::test]
async fn logout_purges_credentials_for_a_live_session() {
    let rig = ConnectionRig::new().await;
    rig.credentials.seed(&key());
    rig.ready(&key()).await;

    assert!(rig.manager.logout(&key()).await.expect("logout"));

    let handle = rig.transport.latest_handle().expect("connected");
    assert!(handle.logged_out.load(Ordering::SeqCst));
    assert!(!rig.credentials.has(&key()));
    assert!(rig.manager.state(&key()).is_none());
    assert!(!rig.settings.is_authenticated(&key()).await.expect("flag"));
}

#[tokio::test]
async fn logout_without_a_session_purges_locally() {
    let rig = ConnectionRig::new().await;
    rig.credentials.seed(&key());
    rig.settings
        .set_authenticated(&key(), true)
        .await
        .expect("flag stored");

    assert!(!rig.manager.logout(&key()).await.expect("logout"));

    assert!(!rig.credentials.has(&key()));
    assert_eq!(rig.credentials.purges.load(Ordering::SeqCst), 1);
    assert!(!rig.settings.is_authenticated(&key()).await.expect("flag"));
}

#[tokio::test]
async fn platform_logout_signal_closes_and_purges() {
    let rig = ConnectionRig::new().await;
    let closed = record_events(&rig.bus, EventKind::SessionClosed);
    rig.credentials.seed(&key());
    rig.ready(&key()).await;

    rig.transport
        .signal(TransportSignal::Closed(CloseReason::LoggedOut))
        .await;

    assert!(rig.wait_for_state(&key(), |s| s.is_none()).await);
    assert!(!rig.credentials.has(&key()));
    assert!(eventually(|| recorded(&closed).len() == 1).await);
    assert_eq!(recorded(&closed)[0]["reason"]["reason"], "logged_out");
}

#[tokio::test]
async fn rotated_credentials_are_saved() {
    let rig = ConnectionRig::new().await;
    rig.ready(&key()).await;
    assert!(!rig.credentials.has(&key()));

    rig.transport
        .signal(TransportSignal::CredentialsUpdated(AuthMaterial(
            serde_json::json!({"token": "t1"}),
        )))
        .await;

    assert!(eventually(|| rig.credentials.has(&key())).await);
}

#[tokio::test]
async fn sweep_closes_idle_sessions() {
    let mut config = fast_connection_config();
    config.inactivity_timeout = Duration::from_secs(60);
    let rig = ConnectionRig::with(config).await;
    rig.credentials.seed(&key());
    rig.ready(&key()).await;

    assert!(rig.manager.sweep(Utc::now()).await.is_empty());

    let closed = rig.manager.sweep(later(120)).await;
    assert_eq!(closed, vec![(key(), ClosedReason::Inactive)]);
    assert!(rig.manager.state(&key()).is_none());
    assert!(rig.credentials.has(&key()), "idle teardown keeps credentials");
}

#[tokio::test]
async fn sweep_closes_sessions_without_credentials() {
    let rig = ConnectionRig::new().await;
    rig.ready(&key()).await;

    let closed = rig.manager.sweep(Utc::now()).await;
    assert_eq!(closed, vec![(key(), ClosedReason::CredentialsMissing)]);
}

#[tokio::test]
async fn sweep_closes_expired_pairings() {
    let rig = ConnectionRig::new().await;
    rig.transport
        .script(Script::Signals(vec![TransportSignal::PairingCode("C".to_owned())]));
    let outcome = rig.manager.acquire(&key()).await;
    assert!(matches!(outcome, Ok(Acquired::PairingRequired(_))));

    assert!(rig.manager.sweep(Utc::now()).await.is_empty());
    let closed = rig.manager.sweep(later(61)).await;
    assert_eq!(closed, vec![(key(), ClosedReason::PairingExpired)]);
}

#[tokio::test]
async fn restore_reconnects_authenticated_sessions() {
    let rig = ConnectionRig::new().await;
    let other = spendwire::types::SessionKey::new("globex", "+15550002");
    rig.credentials.seed(&key());
    rig.settings
        .set_authenticated(&key(), true)
        .await
        .expect("flag stored");
    rig.settings
        .set_authenticated(&other, false)
        .await
        .expect("flag stored");

    assert_eq!(rig.manager.restore().await.expect("restore"), 1);

    assert!(rig.wait_for_state(&key(), |s| s == Some(HandshakeState::Ready)).await);
    assert!(rig.manager.state(&other).is_none());
    assert_eq!(rig.transport.resumed(), vec![true]);
}

#[tokio::test]
async fn shutdown_keeps_sessions_restorable() {
    let rig = ConnectionRig::new().await;
    rig.credentials.seed(&key());
    rig.ready(&key()).await;

    rig.manager.cleanup().await.expect("cleanup");

    assert!(rig.manager.snapshot().is_empty());
    assert!(rig.credentials.has(&key()));
    assert!(rig.settings.is_authenticated(&key()).await.expect("flag"));
}

#[tokio::test]
async fn health_counts_sessions() {
    let rig = ConnectionRig::new().await;
    rig.ready(&key()).await;
    let health = rig.manager.health_check().await;
    assert!(health.is_healthy());
    assert_eq!(health.details(), "1 ready, 0 reconnecting, 1 total");
}
