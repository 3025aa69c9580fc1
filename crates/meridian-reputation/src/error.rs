//! Reputation error types.

use meridian_overlay::OverlayError;
use thiserror::Error;

/// Result type for reputation operations.
pub type Result<T> = std::result::Result<T, ReputationError>;

/// Errors that can occur while applying audit outcomes.
#[derive(Debug, Error)]
pub enum ReputationError {
    /// Propagating a status change to the overlay failed.
    #[error("overlay error: {0}")]
    Overlay(#[from] OverlayError),
}
