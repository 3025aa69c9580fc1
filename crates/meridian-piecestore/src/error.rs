//! Transport error taxonomy.

use meridian_types::AuditOutcome;
use thiserror::Error;

/// Errors surfaced by storage-node operations.
///
/// The variants deliberately mirror the audit classification: callers in
/// audit and repair map each failure onto exactly one [`AuditOutcome`]
/// via [`PieceStoreError::audit_outcome`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PieceStoreError {
    /// The node could not be dialed.
    #[error("dial failed: {0}")]
    Dial(String),

    /// The operation ran out of time.
    #[error("operation timed out")]
    Timeout,

    /// The node does not hold the requested piece.
    #[error("piece not found")]
    NotFound,

    /// The node is still committing the piece and cannot answer yet.
    #[error("piece is contained, retry later")]
    Contained,

    /// The returned data failed hash or signature verification.
    #[error("piece verification failed: {0}")]
    Verification(String),

    /// The node rejected the order limit.
    #[error("order rejected: {0}")]
    Unauthorized(String),

    /// Any other transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl PieceStoreError {
    /// Classifies this failure the way audit and repair score it.
    pub fn audit_outcome(&self) -> AuditOutcome {
        match self {
            Self::Dial(_) | Self::Timeout => AuditOutcome::Offline,
            Self::NotFound | Self::Verification(_) => AuditOutcome::Failure,
            Self::Contained => AuditOutcome::Contained,
            Self::Unauthorized(_) | Self::Transport(_) => AuditOutcome::Unknown,
        }
    }
}
