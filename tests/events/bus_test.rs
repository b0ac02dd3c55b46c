//! Event bus ordering, one-shot handlers, and middleware.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use spendwire::events::{
    handler_fn, Event, EventBus, EventKind, Middleware, SubscribeOptions,
};
use spendwire::service::Service;

fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &'static str) -> Arc<dyn spendwire::events::EventHandler> {
    let log = Arc::clone(log);
    handler_fn(move |_| {
        log.lock().expect("log lock").push(label.to_owned());
        Ok(json!(label))
    })
}

#[tokio::test]
async fn handlers_run_by_priority_then_registration() {
    let bus = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.on(EventKind::ImageQueued, recorder(&log, "low"), SubscribeOptions::priority(-1));
    bus.on(EventKind::ImageQueued, recorder(&log, "first"), SubscribeOptions::default());
    bus.on(EventKind::ImageQueued, recorder(&log, "high"), SubscribeOptions::priority(10));
    bus.on(EventKind::ImageQueued, recorder(&log, "second"), SubscribeOptions::default());

    let outcomes = bus.emit(EventKind::ImageQueued, Value::Null, "test").await;

    assert_eq!(
        *log.lock().expect("log lock"),
        vec!["high", "first", "second", "low"]
    );
    let results: Vec<Value> = outcomes
        .into_iter()
        .map(|o| o.result.expect("handler succeeded"))
        .collect();
    assert_eq!(results, vec![json!("high"), json!("first"), json!("second"), json!("low")]);
}

#[tokio::test]
async fn once_handlers_fire_a_single_time() {
    let bus = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.on(
        EventKind::FlowCompleted,
        recorder(&log, "once"),
        SubscribeOptions::default().once(),
    );
    bus.on(EventKind::FlowCompleted, recorder(&log, "always"), SubscribeOptions::default());

    bus.emit(EventKind::FlowCompleted, Value::Null, "test").await;
    bus.emit(EventKind::FlowCompleted, Value::Null, "test").await;

    assert_eq!(
        *log.lock().expect("log lock"),
        vec!["once", "always", "always"]
    );
    assert_eq!(bus.handler_count(EventKind::FlowCompleted), 1);
}

#[tokio::test]
async fn off_removes_a_subscription() {
    let bus = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let id = bus.on(EventKind::SessionReady, recorder(&log, "x"), SubscribeOptions::default());

    assert!(bus.off(id));
    assert!(!bus.off(id));
    assert!(bus.emit(EventKind::SessionReady, Value::Null, "test").await.is_empty());
    assert!(log.lock().expect("log lock").is_empty());
}

#[tokio::test]
async fn failing_handler_does_not_stop_the_others() {
    let bus = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.on(
        EventKind::FlowFailed,
        handler_fn(|_| Err(anyhow::anyhow!("boom"))),
        SubscribeOptions::priority(5),
    );
    bus.on(EventKind::FlowFailed, recorder(&log, "after"), SubscribeOptions::default());

    let outcomes = bus.emit(EventKind::FlowFailed, Value::Null, "test").await;

    assert_eq!(outcomes.len(), 2);
    assert!(!outcomes[0].success());
    assert_eq!(outcomes[0].result.clone().expect_err("failed"), "boom");
    assert!(outcomes[1].success());
    assert_eq!(*log.lock().expect("log lock"), vec!["after"]);
}

#[tokio::test]
async fn events_only_reach_their_kind() {
    let bus = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.on(EventKind::SessionClosed, recorder(&log, "closed"), SubscribeOptions::default());

    bus.emit(EventKind::SessionReady, Value::Null, "test").await;
    assert!(log.lock().expect("log lock").is_empty());
}

struct Tagger {
    seen: Arc<Mutex<Vec<(EventKind, String)>>>,
    fail: bool,
}

#[async_trait]
impl Middleware for Tagger {
    fn name(&self) -> &str {
        "tagger"
    }

    async fn process(&self, event: &Event) -> anyhow::Result<()> {
        self.seen
            .lock()
            .expect("seen lock")
            .push((event.kind, event.source.clone()));
        if self.fail {
            anyhow::bail!("middleware broke");
        }
        Ok(())
    }
}

#[tokio::test]
async fn middleware_sees_every_event_and_never_blocks() {
    let bus = EventBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.use_middleware(Arc::new(Tagger {
        seen: Arc::clone(&seen),
        fail: true,
    }));
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.on(EventKind::MessageReceived, recorder(&log, "handled"), SubscribeOptions::default());

    bus.emit(EventKind::MessageReceived, json!({"id": 1}), "connection").await;
    bus.emit(EventKind::ImageQueued, Value::Null, "queue").await;

    assert_eq!(
        *seen.lock().expect("seen lock"),
        vec![
            (EventKind::MessageReceived, "connection".to_owned()),
            (EventKind::ImageQueued, "queue".to_owned()),
        ]
    );
    assert_eq!(*log.lock().expect("log lock"), vec!["handled"]);
}

#[tokio::test]
async fn published_events_carry_payload_and_metadata() {
    let bus = EventBus::new();
    let captured = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&captured);
    bus.on(
        EventKind::ImageQueued,
        handler_fn(move |event| {
            *sink.lock().expect("sink lock") = Some(event.clone());
            Ok(Value::Null)
        }),
        SubscribeOptions::default(),
    );

    let event = Event::new(EventKind::ImageQueued, json!({"bytes": 42}), "queue");
    let id = event.id;
    bus.publish(event).await;

    let got = captured.lock().expect("sink lock").clone().expect("delivered");
    assert_eq!(got.id, id);
    assert_eq!(got.source, "queue");
    #[derive(serde::Deserialize)]
    struct Queued {
        bytes: usize,
    }
    assert_eq!(got.payload_as::<Queued>().expect("decodes").bytes, 42);
    assert!(got.payload_as::<Vec<String>>().is_err());
}

#[tokio::test]
async fn cleanup_drops_all_subscriptions() {
    let bus = EventBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.on(EventKind::SessionReady, recorder(&log, "x"), SubscribeOptions::default());

    bus.cleanup().await.expect("cleanup");

    assert_eq!(bus.handler_count(EventKind::SessionReady), 0);
    assert!(bus.health_check().await.is_healthy());
}

#[test]
fn terminal_kinds_are_the_flow_endings() {
    let terminal: Vec<EventKind> = [
        EventKind::SessionPairing,
        EventKind::SessionReady,
        EventKind::SessionDegraded,
        EventKind::SessionClosed,
        EventKind::MessageReceived,
        EventKind::ImageQueued,
        EventKind::FlowCompleted,
        EventKind::FlowCancelled,
        EventKind::FlowFailed,
        EventKind::FlowExpired,
    ]
    .into_iter()
    .filter(|k| k.is_terminal_flow())
    .collect();
    assert_eq!(
        terminal,
        vec![
            EventKind::FlowCompleted,
            EventKind::FlowCancelled,
            EventKind::FlowFailed,
            EventKind::FlowExpired,
        ]
    );
}
