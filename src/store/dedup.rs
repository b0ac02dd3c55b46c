//! Per-message idempotency markers.
//!
//! Every inbound message id moves through `unseen → processing →
//! processed | suppressed` at most once. A single map holds the marker for
//! each id, so the three marker sets are disjoint by construction.
//!
//! Callers must hold exclusive access for the whole check-then-mark in
//! [`DedupLedger::begin`]; the [`StateStore`](super::StateStore) provides
//! it with a lock that is never held across an `.await`.

use std::collections::HashMap;

/// Where a message id currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    /// A handler owns the message right now.
    Processing,
    /// The message was handled.
    Processed,
    /// The message was intentionally ignored.
    Suppressed,
}

/// Returned by [`DedupLedger::begin`] when the id was seen before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("message already {0:?}")]
pub struct Duplicate(pub Marker);

#[derive(Debug, Clone, Copy)]
struct Entry {
    marker: Marker,
    seq: u64,
}

/// Marker ledger for one tenant.
#[derive(Debug)]
pub struct DedupLedger {
    entries: HashMap<String, Entry>,
    next_seq: u64,
    max_entries: usize,
}

impl DedupLedger {
    /// Create a ledger that prunes once it holds more than `max_entries` ids.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            next_seq: 0,
            max_entries: max_entries.max(2),
        }
    }

    /// Claim a message id. Succeeds only for unseen ids.
    ///
    /// # Errors
    ///
    /// Returns [`Duplicate`] with the existing marker when the id was seen.
    pub fn begin(&mut self, message_id: &str) -> Result<(), Duplicate> {
        if let Some(entry) = self.entries.get(message_id) {
            return Err(Duplicate(entry.marker));
        }
        let seq = self.bump();
        self.entries.insert(
            message_id.to_owned(),
            Entry {
                marker: Marker::Processing,
                seq,
            },
        );
        self.prune_if_needed();
        Ok(())
    }

    /// Move a processing id to processed. Returns `false` for any other state.
    pub fn complete(&mut self, message_id: &str) -> bool {
        self.finish(message_id, Marker::Processed)
    }

    /// Move a processing id to suppressed. Returns `false` for any other state.
    pub fn suppress(&mut self, message_id: &str) -> bool {
        self.finish(message_id, Marker::Suppressed)
    }

    /// Current marker for an id.
    pub fn marker(&self, message_id: &str) -> Option<Marker> {
        self.entries.get(message_id).map(|e| e.marker)
    }

    /// Number of tracked ids.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no ids are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Count of ids holding the given marker.
    pub fn count(&self, marker: Marker) -> usize {
        self.entries.values().filter(|e| e.marker == marker).count()
    }

    fn finish(&mut self, message_id: &str, marker: Marker) -> bool {
        match self.entries.get_mut(message_id) {
            Some(entry) if entry.marker == Marker::Processing => {
                entry.marker = marker;
                true
            }
            _ => false,
        }
    }

    fn bump(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        seq
    }

    /// Keep the most recent half by insertion order. In-flight ids are
    /// never dropped so a redelivery cannot slip past a running handler.
    fn prune_if_needed(&mut self) {
        if self.entries.len() <= self.max_entries {
            return;
        }
        let keep = self.max_entries / 2;
        let mut seqs: Vec<u64> = self.entries.values().map(|e| e.seq).collect();
        seqs.sort_unstable_by(|a, b| b.cmp(a));
        let cutoff = seqs.get(keep.saturating_sub(1)).copied().unwrap_or(0);
        self.entries
            .retain(|_, e| e.seq >= cutoff || e.marker == Marker::Processing);
    }
}
