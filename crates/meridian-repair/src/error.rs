//! Repair error types.

use thiserror::Error;

/// Result type for repair operations.
pub type Result<T> = std::result::Result<T, RepairError>;

/// Errors that can occur while checking or repairing segments.
#[derive(Debug, Error)]
pub enum RepairError {
    #[error("metabase error: {0}")]
    Metabase(#[from] meridian_metabase::MetabaseError),

    #[error("overlay error: {0}")]
    Overlay(#[from] meridian_overlay::OverlayError),

    #[error("orders error: {0}")]
    Orders(#[from] meridian_orders::OrderError),

    #[error("erasure error: {0}")]
    Erasure(#[from] meridian_erasure::ErasureError),

    #[error("reputation error: {0}")]
    Reputation(#[from] meridian_reputation::ReputationError),

    /// Fewer than the hard minimum of repair uploads succeeded.
    #[error("repair upload fell short: {successful} of {needed} needed")]
    UploadShortfall { successful: usize, needed: usize },
}
