//! Error taxonomy for backfill sessions and their collaborators.

use thiserror::Error;

use super::types::{BranchId, SessionId, StateTimestamp};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by a [`BranchHistory`](super::history::BranchHistory).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HistoryError {
    #[error("unknown branch {0}")]
    UnknownBranch(BranchId),

    #[error("branch {0} already recorded with different content")]
    DuplicateBranch(BranchId),

    #[error("branch {id} interval cannot be rewritten: {detail}")]
    IntervalRewrite { id: BranchId, detail: String },

    #[error("failed to persist branch history: {0}")]
    Persist(#[source] BoxError),
}

/// Errors raised by a [`StoreView`](super::store::StoreView).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    #[error("write outside authorized region: {0}")]
    OutOfBoundsWrite(String),

    #[error("store is corrupt: {0}")]
    Corrupt(String),

    #[error("store backend failed: {0}")]
    Backend(#[source] BoxError),
}

/// Terminal outcome of a failed backfill session.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackfillError {
    #[error("backfill interrupted")]
    Interrupted,

    #[error("backfill peer lost: {0}")]
    ResourceLost(String),

    #[error("no usable backfiller: {0}")]
    BackfillerUnavailable(String),

    #[error("backfiller failed: {0}")]
    ResponderFailed(String),

    #[error("chunk order violation: {0}")]
    ChunkOrderViolation(String),

    #[error("write outside authorized region: {0}")]
    OutOfBoundsWrite(String),

    #[error("unknown branch {0}")]
    UnknownBranch(BranchId),

    #[error("branch {0} already recorded with different content")]
    DuplicateBranch(BranchId),

    #[error("lineage anomaly: {0}")]
    LineageAnomaly(String),

    #[error("session {0} already active")]
    DuplicateSession(SessionId),

    #[error("chunk stamped {chunk} is newer than its meta timestamp {meta}")]
    TimestampBeyondMeta {
        chunk: StateTimestamp,
        meta: StateTimestamp,
    },

    #[error("branch history failed: {0}")]
    History(#[source] HistoryError),

    #[error("store failed: {0}")]
    Store(#[source] StoreError),
}

impl BackfillError {
    /// Whether a retry with a fresh session id may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackfillError::Interrupted
                | BackfillError::ResourceLost(_)
                | BackfillError::BackfillerUnavailable(_)
        )
    }

    /// Whether the error indicates a peer or caller bug rather than an
    /// environmental condition.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            BackfillError::ChunkOrderViolation(_)
                | BackfillError::OutOfBoundsWrite(_)
                | BackfillError::TimestampBeyondMeta { .. }
                | BackfillError::UnknownBranch(_)
                | BackfillError::DuplicateBranch(_)
                | BackfillError::LineageAnomaly(_)
        )
    }
}

impl From<HistoryError> for BackfillError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::UnknownBranch(id) => BackfillError::UnknownBranch(id),
            HistoryError::DuplicateBranch(id) => BackfillError::DuplicateBranch(id),
            other => BackfillError::History(other),
        }
    }
}

impl From<StoreError> for BackfillError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::OutOfBoundsWrite(detail) => BackfillError::OutOfBoundsWrite(detail),
            other => BackfillError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collaborator_errors_map_onto_taxonomy() {
        let id = BranchId::generate();
        let err: BackfillError = HistoryError::UnknownBranch(id).into();
        assert!(matches!(err, BackfillError::UnknownBranch(got) if got == id));
        assert!(err.is_contract_violation());

        let err: BackfillError = StoreError::OutOfBoundsWrite("[x, y)".into()).into();
        assert!(matches!(err, BackfillError::OutOfBoundsWrite(_)));

        let err: BackfillError = StoreError::Corrupt("bad".into()).into();
        assert!(matches!(err, BackfillError::Store(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(BackfillError::Interrupted.is_retryable());
        assert!(BackfillError::ResourceLost("gone".into()).is_retryable());
        assert!(!BackfillError::ChunkOrderViolation("seq".into()).is_retryable());
    }
}
