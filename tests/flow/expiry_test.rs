//! Idle flows time out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;

use spendwire::events::{handler_fn, EventKind, SubscribeOptions};
use spendwire::flow::render::CONFIRMATION_EXPIRED;
use spendwire::flow::FlowConfig;

use crate::support::{eventually, fields, key, receipt, Pipeline, PipelineOptions, THREAD};

fn later(minutes: i64) -> chrono::DateTime<Utc> {
    Utc::now()
        .checked_add_signed(chrono::Duration::minutes(minutes))
        .expect("in range")
}

#[tokio::test]
async fn confirmations_expire_with_a_notice() {
    let p = Pipeline::new().await;
    let expired = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&expired);
    p.bus.on(
        EventKind::FlowExpired,
        handler_fn(move |_| {
            *counter.lock().expect("counter") += 1;
            Ok(Value::Null)
        }),
        SubscribeOptions::default(),
    );
    p.flow
        .begin_confirmation(&key(), THREAD, "img-1", receipt(8), fields(&[("amount", "1")]))
        .await
        .expect("confirmation starts");

    assert_eq!(p.flow.expire(later(5)).await, 0, "not idle long enough");
    assert_eq!(p.flow.expire(later(11)).await, 1);

    assert_eq!(p.outbound.last_text().as_deref(), Some(CONFIRMATION_EXPIRED));
    assert_eq!(p.state.flow_kind(&key(), THREAD), None);
    assert_eq!(*expired.lock().expect("counter"), 1);
}

#[tokio::test]
async fn captures_expire_silently() {
    let p = Pipeline::new().await;
    p.flow
        .start_capture(&key(), THREAD, "m-0", None)
        .await
        .expect("capture starts");
    p.outbound.clear();

    // Past the confirmation timeout but inside the capture timeout.
    assert_eq!(p.flow.expire(later(20)).await, 0);
    assert_eq!(p.flow.expire(later(31)).await, 1);
    assert!(p.outbound.texts().is_empty());
    assert_eq!(p.state.active_flows(), 0);
}

#[tokio::test]
async fn sweep_task_expires_and_stops_on_shutdown() {
    let p = Pipeline::with(PipelineOptions {
        flow: FlowConfig {
            confirmation_timeout: Duration::ZERO,
            ..FlowConfig::default()
        },
        ..PipelineOptions::default()
    })
    .await;
    p.flow
        .begin_confirmation(&key(), THREAD, "img-1", receipt(8), fields(&[("amount", "1")]))
        .await
        .expect("confirmation starts");

    let (tx, rx) = watch::channel(false);
    let sweep = p.flow.spawn_expiry_sweep(Duration::from_millis(20), rx);

    assert!(eventually(|| p.state.active_flows() == 0).await);
    assert!(eventually(|| p.outbound.last_text().as_deref() == Some(CONFIRMATION_EXPIRED)).await);

    tx.send(true).expect("sweep listening");
    sweep.await.expect("sweep exits cleanly");
}
