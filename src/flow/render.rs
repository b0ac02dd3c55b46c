//! User-facing text for capture flows.

use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::edits::ReplyTokens;
use crate::types::{FieldMap, Question};

static PLACEHOLDER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").ok());

/// Sent when an image arrives while another capture is still open.
pub const FINISH_CURRENT_FIRST: &str =
    "Please finish the current expense first (reply to the question above, or send \"cancel\").";

/// Sent when an AI confirmation times out.
pub const CONFIRMATION_EXPIRED: &str =
    "That expense confirmation timed out and was discarded. Send the receipt again to retry.";

/// Sent after a cancel.
pub const CANCELLED: &str = "Expense discarded.";

/// Sent while an image is being read.
pub const READING_RECEIPT: &str = "Got it, reading the receipt...";

/// Sent when the broker is unavailable and the image is handled locally.
pub const BROKER_DEGRADED: &str =
    "Processing is slower than usual right now, your receipt is still being handled.";

/// `cost_center` → `Cost center`.
pub fn humanize(field: &str) -> String {
    let spaced = field.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Bulleted field list: declared questions first, in order, then any extra
/// fields the extractor returned. Empty values show as `-`.
pub fn summary(fields: &FieldMap, questions: &[Question]) -> String {
    let mut out = String::new();
    for question in questions {
        let value = fields
            .get(&question.field)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or("-");
        let _ = writeln!(out, "• {}: {value}", humanize(&question.field));
    }
    for (field, value) in fields {
        if questions.iter().any(|q| &q.field == field) {
            continue;
        }
        let _ = writeln!(out, "• {}: {value}", humanize(field));
    }
    out.trim_end().to_owned()
}

/// Prompt asking the user to confirm or correct extracted data.
pub fn confirmation_prompt(
    fields: &FieldMap,
    questions: &[Question],
    tokens: &ReplyTokens,
    modified: bool,
) -> String {
    let heading = if modified {
        "Updated expense:"
    } else {
        "Here is what I read from the receipt:"
    };
    format!(
        "{heading}\n{}\n\nReply \"{}\" to save, \"{}\" to discard, or correct a field (e.g. \"amount: 12.50\").",
        summary(fields, questions),
        tokens.primary_confirm(),
        tokens.primary_cancel(),
    )
}

/// Re-prompt after a reply that could not be understood as edits.
pub fn edit_not_understood(tokens: &ReplyTokens) -> String {
    format!(
        "Sorry, I couldn't understand that change. Use \"field: value\", or reply \"{}\" to save or \"{}\" to discard.",
        tokens.primary_confirm(),
        tokens.primary_cancel(),
    )
}

/// Replace `{field}` placeholders with field values. Unknown placeholders
/// render empty.
pub fn fill_template(template: &str, fields: &FieldMap) -> String {
    let Some(pattern) = PLACEHOLDER.as_ref() else {
        return template.to_owned();
    };
    pattern
        .replace_all(template, |caps: &Captures<'_>| {
            caps.get(1)
                .and_then(|name| fields.get(name.as_str()))
                .cloned()
                .unwrap_or_default()
        })
        .into_owned()
}

/// Final message after a capture is written.
///
/// `template` is the tenant's message template, if any.
pub fn completion_message(
    fields: &FieldMap,
    questions: &[Question],
    template: Option<&str>,
    image_failed: bool,
) -> String {
    let body = match template.filter(|t| !t.trim().is_empty()) {
        Some(template) => fill_template(template, fields),
        None => format!("Expense saved:\n{}", summary(fields, questions)),
    };
    if image_failed {
        format!("{body}\n\n(The record was saved, but the receipt image could not be uploaded.)")
    } else {
        body
    }
}
