//! Audit error types.

use thiserror::Error;

/// Result type for audit operations.
pub type Result<T> = std::result::Result<T, AuditError>;

/// Errors that can occur in the audit pipeline.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Reading or re-reading the segment failed.
    #[error("metabase error: {0}")]
    Metabase(#[from] meridian_metabase::MetabaseError),

    /// Creating order limits failed.
    #[error("orders error: {0}")]
    Orders(#[from] meridian_orders::OrderError),

    /// Stripe reconstruction failed.
    #[error("erasure error: {0}")]
    Erasure(#[from] meridian_erasure::ErasureError),

    /// Applying outcomes to reputation failed.
    #[error("reputation error: {0}")]
    Reputation(#[from] meridian_reputation::ReputationError),
}
