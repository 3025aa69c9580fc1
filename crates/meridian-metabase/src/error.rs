//! Metabase error types.

use meridian_types::{PiecesError, SegmentPosition, StreamId};
use thiserror::Error;

/// Result type for metabase operations.
pub type Result<T> = std::result::Result<T, MetabaseError>;

/// Errors that can occur during metabase operations.
#[derive(Debug, Error)]
pub enum MetabaseError {
    /// No segment exists at the given position.
    #[error("segment not found: {stream}/{position}")]
    NotFound {
        stream: StreamId,
        position: SegmentPosition,
    },

    /// The compare-and-set precondition no longer holds.
    #[error("segment changed under writer: {stream}/{position}")]
    Changed {
        stream: StreamId,
        position: SegmentPosition,
    },

    /// The proposed piece set violates a segment invariant.
    #[error("invalid piece set: {0}")]
    InvalidPieces(#[from] PiecesError),

    /// A segment with the same position already exists.
    #[error("segment already exists: {stream}/{position}")]
    AlreadyExists {
        stream: StreamId,
        position: SegmentPosition,
    },

    /// The segment loop was shut down while a joiner waited.
    #[error("segment loop shut down")]
    LoopShutdown,
}
