//! Overlay error types.

use meridian_types::NodeId;
use thiserror::Error;

/// Result type for overlay operations.
pub type Result<T> = std::result::Result<T, OverlayError>;

/// Errors that can occur during overlay operations.
#[derive(Debug, Error)]
pub enum OverlayError {
    /// The node has never checked in.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// Node selection could not satisfy the request.
    #[error("not enough nodes: requested {requested}, found {available}")]
    NotEnoughNodes { requested: usize, available: usize },

    /// A node address could not be parsed.
    #[error("invalid node address: {0}")]
    InvalidAddress(String),
}
