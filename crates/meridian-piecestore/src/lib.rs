//! # meridian-piecestore: The storage-node wire surface
//!
//! Message types exchanged with storage nodes over their authenticated
//! streams, and the [`NodeClient`] seam audit, repair and garbage
//! collection dial through. The transport itself (TLS, framing, chunked
//! piece transfer) lives outside the durability core; everything the core
//! decides on is defined here: errors classified into audit outcomes,
//! retain payloads, and the graceful-exit conversation.

mod client;
mod error;
mod messages;

pub use client::{ExitStream, NodeClient};
pub use error::PieceStoreError;
pub use messages::{
    ExitFailedReason, NodeMessage, RetainRequest, SatelliteMessage, TransferFailureCode,
    TransferPiece,
};
