//! Graceful-exit error types.

use meridian_types::NodeId;
use thiserror::Error;

/// Result type for graceful-exit operations.
pub type Result<T> = std::result::Result<T, ExitError>;

/// Errors that can occur during exit scheduling or a session.
#[derive(Debug, Error)]
pub enum ExitError {
    #[error("metabase error: {0}")]
    Metabase(#[from] meridian_metabase::MetabaseError),

    #[error("overlay error: {0}")]
    Overlay(#[from] meridian_overlay::OverlayError),

    #[error("orders error: {0}")]
    Orders(#[from] meridian_orders::OrderError),

    /// The node transport failed mid-session.
    #[error("stream error: {0}")]
    Stream(#[from] meridian_piecestore::PieceStoreError),

    /// A second concurrent session for the same node.
    #[error("exit session already active for {0}")]
    SessionActive(NodeId),

    /// The node is younger than the configured minimum age.
    #[error("node {0} too young for graceful exit")]
    IneligibleYoung(NodeId),

    /// The node sent nothing within the receive timeout.
    #[error("deadline exceeded waiting for node message")]
    RecvTimeout,
}
