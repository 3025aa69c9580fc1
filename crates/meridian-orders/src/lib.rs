//! # meridian-orders: Signed storage-node authorisations
//!
//! Every byte a storage node serves or accepts is covered by an
//! [`OrderLimit`]: a short-lived, satellite-signed grant for one action on
//! one piece. The issuer consults the overlay before granting repair
//! downloads: nodes the directory considers unreliable are refused and
//! reported back so the caller can demote them from its healthy set.
//!
//! Nodes answer uploads with a [`StorageNodeHash`], signed with their
//! identity key; verification failure is a protocol error and counts as
//! an audit failure for that piece.

mod identity;
mod limits;
mod service;

pub use identity::{PiecePrivateKey, SatelliteIdentity};
pub use limits::{Action, OrderLimit, SerialNumber, SignedOrderLimit, StorageNodeHash, piece_hash};
pub use service::{LimitedNode, OrderService, OrdersConfig, RepairGetLimits};

use meridian_overlay::OverlayError;
use thiserror::Error;

/// Result type for order operations.
pub type Result<T> = std::result::Result<T, OrderError>;

/// Errors that can occur while creating or verifying order limits.
#[derive(Debug, Error)]
pub enum OrderError {
    /// The signature does not verify against the expected key.
    #[error("signature verification failed")]
    InvalidSignature,

    /// The order limit expired before use.
    #[error("order limit expired at {0}")]
    Expired(chrono::DateTime<chrono::Utc>),

    /// Node lookup or reliability check failed.
    #[error("overlay error: {0}")]
    Overlay(#[from] OverlayError),
}
