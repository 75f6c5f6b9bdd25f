//! Notifications published by the sync worker on the broadcast bus.
//!
//! Callers that passed a callback get their records directly; the bus is for
//! observers that need to follow every chunk, including dropped ones.

use crate::hashtag::HashtagRecord;

/// How a dispatched (or suppressed) chunk ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// Response reconciled; `records` outcomes were produced.
    Reconciled { records: usize },
    /// Dropped without a call because the cooldown window is open.
    Suppressed,
    /// Service signaled throttling; cooldown started.
    Throttled,
    /// Network or TLS failure.
    TransportFailed(String),
    /// Non-ok status, unparseable body or unrecognized payload.
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    /// One outcome record, emitted after persistence.
    RecordSynced(HashtagRecord),
    /// `request_id` is the id returned when the lookup was queued.
    ChunkFinished {
        request_id: u64,
        chunk: String,
        outcome: ChunkOutcome,
    },
    CooldownStarted {
        resume_not_before: i64,
    },
    CurrentUserChanged(String),
}
