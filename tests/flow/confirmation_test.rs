//! AI confirmation: confirm, cancel, and edit loops.

use std::sync::atomic::Ordering;

use spendwire::flow::render::CANCELLED;
use spendwire::store::{FlowKind, ThreadFlow};

use crate::support::{fields, key, receipt, text, ExtractBehavior, Pipeline, THREAD};

async fn confirming() -> Pipeline {
    let p = Pipeline::new().await;
    p.flow
        .begin_confirmation(
            &key(),
            THREAD,
            "img-1",
            receipt(16),
            fields(&[
                ("merchant", "Corner Cafe"),
                ("amount", "12.50"),
                ("date", "2024-01-31"),
            ]),
        )
        .await
        .expect("confirmation starts");
    p
}

fn current_amount(p: &Pipeline) -> Option<String> {
    match p.state.flow(&key(), THREAD) {
        Some(ThreadFlow::Confirming(c)) => c.fields.get("amount").cloned(),
        _ => None,
    }
}

#[tokio::test]
async fn prompt_lists_fields_and_tokens() {
    let p = confirming().await;
    let prompt = p.outbound.last_text().expect("prompt");
    assert!(prompt.starts_with("Here is what I read from the receipt:"), "{prompt}");
    assert!(prompt.contains("• Merchant: Corner Cafe"));
    assert!(prompt.contains("\"ok\" to save"));
    assert!(prompt.contains("\"cancel\" to discard"));
}

#[tokio::test]
async fn confirm_writes_record_with_image() {
    let p = confirming().await;

    p.router.route(&key(), &text("r-1", "OK!")).await;

    let record = p.storage.records().pop().expect("record written");
    assert_eq!(record.fields.get("amount").map(String::as_str), Some("12.50"));
    assert!(record.image_url.is_some());
    assert_eq!(p.storage.uploads().len(), 1);
    assert!(p
        .outbound
        .last_text()
        .is_some_and(|t| t.starts_with("Expense saved:")));
    assert_eq!(p.state.flow_kind(&key(), THREAD), None);
}

#[tokio::test]
async fn cancel_discards_without_writing() {
    let p = confirming().await;
    p.router.route(&key(), &text("r-1", "cancel")).await;

    assert_eq!(p.outbound.last_text().as_deref(), Some(CANCELLED));
    assert!(p.storage.records().is_empty());
    assert!(p.storage.uploads().is_empty());
    assert_eq!(p.state.flow_kind(&key(), THREAD), None);
}

#[tokio::test]
async fn local_edit_updates_and_represents() {
    let p = confirming().await;

    p.router.route(&key(), &text("r-1", "Amount: 20.00")).await;

    assert_eq!(current_amount(&p).as_deref(), Some("20.00"));
    assert_eq!(p.extractor.edit_calls.load(Ordering::SeqCst), 0);
    let prompt = p.outbound.last_text().expect("prompt");
    assert!(prompt.starts_with("Updated expense:"), "{prompt}");
    assert!(prompt.contains("• Amount: 20.00"));
    assert!(p.storage.records().is_empty());

    p.router.route(&key(), &text("r-2", "yes")).await;
    let record = p.storage.records().pop().expect("record written");
    assert_eq!(record.fields.get("amount").map(String::as_str), Some("20.00"));
}

#[tokio::test]
async fn free_text_edits_go_to_the_extractor() {
    let p = confirming().await;
    p.extractor.set_edits(ExtractBehavior::Fields(fields(&[
        ("merchant", "Corner Cafe"),
        ("amount", "30.00"),
        ("date", "2024-01-31"),
    ])));

    p.router
        .route(&key(), &text("r-1", "it was actually thirty dollars"))
        .await;

    assert_eq!(p.extractor.edit_calls.load(Ordering::SeqCst), 1);
    assert_eq!(current_amount(&p).as_deref(), Some("30.00"));
    assert_eq!(p.state.flow_kind(&key(), THREAD), Some(FlowKind::Confirming));
}

#[tokio::test]
async fn reply_without_changes_confirms() {
    let p = confirming().await;
    p.extractor.set_edits(ExtractBehavior::Fields(fields(&[
        ("merchant", "Corner Cafe"),
        ("amount", "12.50"),
        ("date", "2024-01-31"),
    ])));

    p.router.route(&key(), &text("r-1", "looks right to me")).await;

    assert_eq!(p.storage.records().len(), 1);
    assert_eq!(p.state.flow_kind(&key(), THREAD), None);
}

#[tokio::test]
async fn restating_a_current_value_confirms() {
    let p = confirming().await;

    p.router.route(&key(), &text("r-1", "amount: 12.50")).await;

    assert_eq!(p.storage.records().len(), 1);
    assert_eq!(p.state.flow_kind(&key(), THREAD), None);
    // The local parser found the pair, so the extractor was never asked.
    assert_eq!(p.extractor.edit_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unreadable_edit_reprompts_and_keeps_data() {
    let p = confirming().await;
    p.extractor.set_edits(ExtractBehavior::Unavailable);

    p.router.route(&key(), &text("r-1", "hmm not sure")).await;

    let prompt = p.outbound.last_text().expect("re-prompt");
    assert!(prompt.starts_with("Sorry, I couldn't understand that change."), "{prompt}");
    assert_eq!(current_amount(&p).as_deref(), Some("12.50"));
    assert!(p.storage.records().is_empty());
}

#[tokio::test]
async fn repeated_reply_id_is_ignored() {
    let p = confirming().await;
    let reply = text("r-1", "amount: 1");
    p.flow
        .handle_confirmation_reply(&key(), THREAD, &reply)
        .await
        .expect("edit");
    let sent = p.outbound.texts().len();

    p.flow
        .handle_confirmation_reply(&key(), THREAD, &reply)
        .await
        .expect("repeat");
    assert_eq!(p.outbound.texts().len(), sent);
}
