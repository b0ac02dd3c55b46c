//! Exactly-once handling of inbound message ids.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::json;

use spendwire::events::EventKind;
use spendwire::router::{Route, RouteOutcome, Suppression};
use spendwire::store::dedup::Marker;
use spendwire::types::InboundEnvelope;

use crate::support::{key, text, Pipeline};

#[tokio::test]
async fn repeated_id_is_handled_once() {
    let p = Pipeline::new().await;
    let message = text("m-1", "expense");

    let first = p.router.route(&key(), &message).await;
    let second = p.router.route(&key(), &message).await;

    assert_eq!(first, RouteOutcome::Handled(Route::StartCapture));
    assert_eq!(second, RouteOutcome::Duplicate);
    assert_eq!(p.outbound.texts().len(), 1, "only one prompt sent");
    assert_eq!(p.state.marker(&key(), "m-1"), Some(Marker::Processed));
}

#[tokio::test]
async fn suppressed_ids_stay_suppressed() {
    let p = Pipeline::new().await;
    let message = text("m-2", "hello there");

    assert_eq!(
        p.router.route(&key(), &message).await,
        RouteOutcome::Suppressed(Suppression::NoActiveFlow)
    );
    assert_eq!(p.state.marker(&key(), "m-2"), Some(Marker::Suppressed));
    assert_eq!(p.router.route(&key(), &message).await, RouteOutcome::Duplicate);
}

#[tokio::test]
async fn failed_handler_still_marks_processed() {
    let p = Pipeline::new().await;
    p.outbound.fail_sends.store(true, Ordering::SeqCst);
    let message = text("m-3", "expense");

    let outcome = p.router.route(&key(), &message).await;

    assert_eq!(outcome, RouteOutcome::Failed(Route::StartCapture));
    assert_eq!(p.state.marker(&key(), "m-3"), Some(Marker::Processed));

    p.outbound.fail_sends.store(false, Ordering::SeqCst);
    assert_eq!(p.router.route(&key(), &message).await, RouteOutcome::Duplicate);
    assert!(p.outbound.texts().is_empty());
}

#[tokio::test]
async fn same_id_on_another_session_is_independent() {
    let p = Pipeline::new().await;
    let other = spendwire::types::SessionKey::new("globex", "+15550002");
    let message = text("m-4", "expense");

    assert_eq!(
        p.router.route(&key(), &message).await,
        RouteOutcome::Handled(Route::StartCapture)
    );
    assert_eq!(
        p.router.route(&other, &message).await,
        RouteOutcome::Handled(Route::StartCapture)
    );
}

#[tokio::test]
async fn bus_delivery_goes_through_the_router() {
    let p = Pipeline::new().await;
    let envelope = InboundEnvelope {
        session: key(),
        message: text("m-5", "Expense"),
    };
    let payload = serde_json::to_value(&envelope).expect("encode envelope");

    let outcomes = p.bus.emit(EventKind::MessageReceived, payload.clone(), "test").await;
    assert_eq!(outcomes.len(), 1);
    let value = outcomes[0].result.clone().expect("router handler succeeds");
    assert_eq!(value, json!({"outcome": "Handled(StartCapture)"}));

    // Redelivery of the same envelope is a no-op.
    let again = p.bus.emit(EventKind::MessageReceived, payload, "test").await;
    let value = again[0].result.clone().expect("router handler succeeds");
    assert_eq!(value, json!({"outcome": "Duplicate"}));
    assert_eq!(p.outbound.texts().len(), 1);
}

#[tokio::test]
async fn malformed_envelope_is_a_handler_error() {
    let p = Pipeline::new().await;
    let outcomes = p
        .bus
        .emit(EventKind::MessageReceived, json!({"nope": true}), "test")
        .await;
    assert_eq!(outcomes.len(), 1);
    assert!(!outcomes[0].success());
}

#[tokio::test]
async fn concurrent_duplicates_run_once() {
    let p = Arc::new(Pipeline::new().await);
    let message = text("m-6", "expense");

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let p = Arc::clone(&p);
        let message = message.clone();
        tasks.push(tokio::spawn(async move {
            p.router.route(&key(), &message).await
        }));
    }
    let mut handled = 0;
    for task in tasks {
        if task.await.expect("task") == RouteOutcome::Handled(Route::StartCapture) {
            handled += 1;
        }
    }
    assert_eq!(handled, 1);
    assert_eq!(p.outbound.texts().len(), 1);
}
