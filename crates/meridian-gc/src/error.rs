//! Garbage-collection error types.

use thiserror::Error;

/// Result type for garbage-collection operations.
pub type Result<T> = std::result::Result<T, GcError>;

/// Errors that can occur during a collection cycle.
#[derive(Debug, Error)]
pub enum GcError {
    #[error("metabase error: {0}")]
    Metabase(#[from] meridian_metabase::MetabaseError),

    #[error("overlay error: {0}")]
    Overlay(#[from] meridian_overlay::OverlayError),
}
