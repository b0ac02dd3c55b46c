//! Reading confirmation replies: confirm and cancel tokens, and
//! `field: value` edits against the declared question list.

use std::sync::LazyLock;

use regex::Regex;

use crate::types::{FieldMap, Question};

/// One `field: value` (or `field = value`) pair.
static FIELD_PAIR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*([A-Za-z][A-Za-z0-9 _-]*?)\s*[:=]\s*(.+?)\s*$").ok());

/// What a reply to a confirmation prompt asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Save the data as presented.
    Confirm,
    /// Discard the capture.
    Cancel,
    /// Anything else: candidate edits.
    Edit(String),
}

/// Literal confirm/cancel tokens, compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTokens {
    confirm: Vec<String>,
    cancel: Vec<String>,
}

impl Default for ReplyTokens {
    fn default() -> Self {
        Self::new(vec!["ok".to_owned(), "yes".to_owned()], vec!["cancel".to_owned()])
    }
}

impl ReplyTokens {
    /// Build from configured token lists.
    pub fn new(confirm: Vec<String>, cancel: Vec<String>) -> Self {
        let normalize = |tokens: Vec<String>| -> Vec<String> {
            tokens
                .into_iter()
                .map(|t| normalize_token(&t))
                .filter(|t| !t.is_empty())
                .collect()
        };
        Self {
            confirm: normalize(confirm),
            cancel: normalize(cancel),
        }
    }

    /// Classify a reply.
    pub fn classify(&self, text: &str) -> Reply {
        let token = normalize_token(text);
        if self.cancel.contains(&token) {
            Reply::Cancel
        } else if self.confirm.contains(&token) {
            Reply::Confirm
        } else {
            Reply::Edit(text.trim().to_owned())
        }
    }

    /// Tokens shown in prompts, e.g. `ok`.
    pub fn primary_confirm(&self) -> &str {
        self.confirm.first().map_or("ok", String::as_str)
    }

    /// Token shown in prompts, e.g. `cancel`.
    pub fn primary_cancel(&self) -> &str {
        self.cancel.first().map_or("cancel", String::as_str)
    }
}

fn normalize_token(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(['.', '!'])
        .trim()
        .to_lowercase()
}

/// Normalized form used to match a typed field name to a question.
fn field_key(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

/// Parse `field: value` pairs, one per line or separated by `;`.
///
/// Only fields named in `questions` are returned. Later pairs for the same
/// field win. An empty map means the text held no recognizable edit.
pub fn parse_field_edits(text: &str, questions: &[Question]) -> FieldMap {
    let mut edits = FieldMap::new();
    let Some(pattern) = FIELD_PAIR.as_ref() else {
        return edits;
    };

    for part in text.split(['\n', ';']) {
        let Some(caps) = pattern.captures(part) else {
            continue;
        };
        let (Some(name), Some(value)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let wanted = field_key(name.as_str());
        if let Some(question) = questions.iter().find(|q| field_key(&q.field) == wanted) {
            edits.insert(question.field.clone(), value.as_str().to_owned());
        }
    }
    edits
}
