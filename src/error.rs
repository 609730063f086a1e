use crate::ready::ReadyStates;
use crate::DocId;

/// Errors surfaced across the public API (spec §7). Failures internal to
/// message handling — a permission denial, a malformed envelope, a dead
/// transport write — are never turned into a `SyncError`; they're logged
/// and the handler drops the offending message, per spec's "fail silently
/// toward the network, fail loudly toward the caller" split.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// `waitUntilReady` (or any sync-dependent call) was attempted with no
    /// adapters registered at all.
    #[error("no adapters registered on this synchronizer")]
    NoAdapters,

    /// A `waitUntilReady` deadline elapsed before the predicate was satisfied.
    /// Carries the ready-state snapshot at the moment of timeout so callers
    /// can report which peers were still missing.
    #[error("sync timed out for document {doc_id} waiting on {ready_states:?}")]
    SyncTimeout {
        doc_id: DocId,
        ready_states: ReadyStates,
    },

    /// The caller's own cancellation token fired before the wait resolved.
    #[error("wait aborted for document {0}")]
    Aborted(DocId),

    /// The target document does not exist locally and creating it was
    /// disallowed, or it is locally marked deleted.
    #[error("document {0} does not exist")]
    NotFound(DocId),
}
