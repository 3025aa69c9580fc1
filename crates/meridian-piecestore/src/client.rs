//! Client seams over the node transport.

use async_trait::async_trait;
use meridian_orders::{PiecePrivateKey, SignedOrderLimit, StorageNodeHash};
use meridian_overlay::SelectedNode;

use crate::error::PieceStoreError;
use crate::messages::{NodeMessage, RetainRequest, SatelliteMessage};

/// Dialing surface for piece operations against storage nodes.
///
/// The satellite core holds one implementation of this for its lifetime;
/// tests substitute an in-process network. Every method call is one
/// authenticated stream to the addressed node, bounded by the caller's
/// timeout.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Uploads a full piece under a PUT or PUT_REPAIR limit and returns
    /// the node's signed hash receipt.
    async fn upload_piece(
        &self,
        node: &SelectedNode,
        limit: &SignedOrderLimit,
        piece_key: &PiecePrivateKey,
        data: &[u8],
    ) -> Result<StorageNodeHash, PieceStoreError>;

    /// Downloads a full piece under a GET or GET_REPAIR limit, together
    /// with the node's stored hash receipt for integrity checking.
    async fn download_piece(
        &self,
        node: &SelectedNode,
        limit: &SignedOrderLimit,
        piece_key: &PiecePrivateKey,
    ) -> Result<(Vec<u8>, StorageNodeHash), PieceStoreError>;

    /// Downloads a single erasure share at `stripe_index` under a
    /// GET_AUDIT limit.
    async fn download_share(
        &self,
        node: &SelectedNode,
        limit: &SignedOrderLimit,
        piece_key: &PiecePrivateKey,
        stripe_index: u32,
        share_size: u32,
    ) -> Result<Vec<u8>, PieceStoreError>;

    /// Delivers a garbage-collection retain request.
    async fn retain(
        &self,
        node: &SelectedNode,
        request: &RetainRequest,
    ) -> Result<(), PieceStoreError>;
}

/// One graceful-exit conversation, driven from the node's inbound stream.
///
/// The endpoint sends [`SatelliteMessage`]s and consumes the node's
/// [`NodeMessage`]s until a terminal message ends the session.
#[async_trait]
pub trait ExitStream: Send {
    async fn send(&mut self, message: SatelliteMessage) -> Result<(), PieceStoreError>;

    /// Receives the node's next message; `None` when the node hung up.
    ///
    /// Must be cancel-safe: the session races this against its producer
    /// and may drop an unresolved call, so no message may be consumed
    /// before the future first resolves.
    async fn recv(&mut self) -> Result<Option<NodeMessage>, PieceStoreError>;
}
