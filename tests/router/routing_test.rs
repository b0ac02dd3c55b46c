//! Routing precedence and suppression rules.

use spendwire::flow::render::FINISH_CURRENT_FIRST;
use spendwire::router::{Route, RouteOutcome, Suppression};
use spendwire::store::settings::TenantSettings;
use spendwire::store::FlowKind;
use spendwire::types::{default_questions, InboundMessage};

use crate::support::{fields, image, key, receipt, text, Pipeline, PipelineOptions, THREAD};

fn from_me(id: &str, body: &str) -> InboundMessage {
    InboundMessage {
        from_me: true,
        ..text(id, body)
    }
}

#[tokio::test]
async fn own_messages_are_ignored() {
    let p = Pipeline::new().await;
    let outcome = p.router.route(&key(), &from_me("m-1", "expense")).await;
    assert_eq!(outcome, RouteOutcome::Suppressed(Suppression::FromSelf));
    assert!(p.outbound.texts().is_empty());
}

#[tokio::test]
async fn only_the_configured_group_is_handled() {
    let p = Pipeline::with(PipelineOptions {
        settings: TenantSettings {
            group_name: Some("EXPENSES".to_owned()),
            ..TenantSettings::default()
        },
        ..PipelineOptions::default()
    })
    .await;

    let elsewhere = InboundMessage {
        thread_name: Some("Family".to_owned()),
        ..text("m-1", "expense")
    };
    assert_eq!(
        p.router.route(&key(), &elsewhere).await,
        RouteOutcome::Suppressed(Suppression::OtherThread)
    );

    // The support builder names its thread "Expenses".
    assert_eq!(
        p.router.route(&key(), &text("m-2", "expense")).await,
        RouteOutcome::Handled(Route::StartCapture)
    );
}

#[tokio::test]
async fn start_keywords_match_case_insensitively() {
    let p = Pipeline::new().await;
    assert_eq!(
        p.router.route(&key(), &text("m-1", "  New Expense ")).await,
        RouteOutcome::Handled(Route::StartCapture)
    );
    assert_eq!(
        p.outbound.last_text().as_deref(),
        Some(default_questions()[0].prompt.as_str())
    );
}

#[tokio::test]
async fn chatter_without_a_flow_is_suppressed() {
    let p = Pipeline::new().await;
    assert_eq!(
        p.router.route(&key(), &text("m-1", "lunch was great")).await,
        RouteOutcome::Suppressed(Suppression::NoActiveFlow)
    );
}

#[tokio::test]
async fn text_goes_to_the_capture_in_progress() {
    let p = Pipeline::new().await;
    p.router.route(&key(), &text("m-1", "expense")).await;

    // Even a start keyword counts as an answer once a capture is open.
    assert_eq!(
        p.router.route(&key(), &text("m-2", "expense")).await,
        RouteOutcome::Handled(Route::Answer)
    );
    assert_eq!(
        p.outbound.last_text().as_deref(),
        Some(default_questions()[1].prompt.as_str())
    );
}

#[tokio::test]
async fn confirmation_wins_over_new_flows() {
    let p = Pipeline::new().await;
    p.flow
        .begin_confirmation(&key(), THREAD, "img-1", receipt(8), fields(&[("amount", "3")]))
        .await
        .expect("confirmation starts");

    assert_eq!(
        p.router.route(&key(), &text("m-1", "expense")).await,
        RouteOutcome::Handled(Route::Confirmation)
    );
}

#[tokio::test]
async fn images_while_busy_get_a_notice() {
    let p = Pipeline::new().await;
    p.router.route(&key(), &text("m-1", "expense")).await;
    p.outbound.clear();

    let outcome = p.router.route(&key(), &image("img-1")).await;

    assert_eq!(outcome, RouteOutcome::Suppressed(Suppression::ImageWhileBusy));
    assert_eq!(p.outbound.texts(), vec![FINISH_CURRENT_FIRST.to_owned()]);
    assert_eq!(p.state.flow_kind(&key(), THREAD), Some(FlowKind::Collecting));
    assert!(p.queue.is_empty());
}

#[tokio::test]
async fn images_while_processing_get_a_notice() {
    let p = Pipeline::new().await;
    assert!(p.state.mark_processing(&key(), THREAD));

    let outcome = p.router.route(&key(), &image("img-2")).await;
    assert_eq!(outcome, RouteOutcome::Suppressed(Suppression::ImageWhileBusy));
    assert_eq!(p.outbound.last_text().as_deref(), Some(FINISH_CURRENT_FIRST));
}

#[tokio::test]
async fn keywords_are_ignored_while_an_image_is_processing() {
    let p = Pipeline::new().await;
    p.state.mark_processing(&key(), THREAD);
    assert_eq!(
        p.router.route(&key(), &text("m-1", "expense")).await,
        RouteOutcome::Suppressed(Suppression::NoActiveFlow)
    );
    assert_eq!(p.state.flow_kind(&key(), THREAD), None);
}

#[tokio::test]
async fn finalizing_threads_ignore_everything() {
    let p = Pipeline::new().await;
    p.state
        .start_flow(
            &key(),
            THREAD,
            spendwire::store::ThreadFlow::Finalizing {
                origin_message_id: "m-0".to_owned(),
                since: chrono::Utc::now(),
            },
        )
        .expect("thread idle");

    assert_eq!(
        p.router.route(&key(), &text("m-1", "ok")).await,
        RouteOutcome::Suppressed(Suppression::Finalizing)
    );
    assert_eq!(
        p.router.route(&key(), &image("img-1")).await,
        RouteOutcome::Suppressed(Suppression::Finalizing)
    );
    assert!(p.outbound.texts().is_empty());
}

#[tokio::test]
async fn idle_images_are_queued_and_processed() {
    let p = Pipeline::new().await;

    let outcome = p.router.route(&key(), &image("img-1")).await;
    assert_eq!(outcome, RouteOutcome::Handled(Route::ImageQueue));

    p.queue.wait_idle().await;
    assert_eq!(p.state.flow_kind(&key(), THREAD), Some(FlowKind::Confirming));
    assert!(!p.state.is_processing(&key(), THREAD));
    let prompt = p.outbound.last_text().expect("confirmation prompt");
    assert!(prompt.contains("Corner Cafe"), "{prompt}");
}
