//! Wire messages.

use chrono::{DateTime, Utc};
use meridian_orders::{SignedOrderLimit, StorageNodeHash};
use meridian_types::{NodeId, PieceId};
use serde::{Deserialize, Serialize};

/// Garbage-collection retain request.
///
/// The node deletes every piece created before `creation_date` whose
/// derived ID is **not** in the filter. The satellite never names pieces
/// to delete; deletion is by absence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetainRequest {
    pub creation_date: DateTime<Utc>,
    /// Encoded Bloom filter over the node's live piece IDs.
    pub filter: Vec<u8>,
}

/// Why a node could not complete one piece transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferFailureCode {
    /// The exiting node no longer holds the piece.
    NotFound,
    /// Anything else; retried up to the per-piece failure cap.
    Unknown,
}

/// Why a graceful exit ended unsuccessfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitFailedReason {
    /// The node sent a message that failed signature verification.
    VerificationFailed,
    /// Too many transfers failed overall.
    OverallFailurePercentageExceeded,
    /// The node made no progress within the inactivity window.
    InactiveTimeframeExceeded,
    /// The node was disqualified before or during the exit.
    Disqualified,
}

/// One piece handover order inside a graceful-exit session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferPiece {
    /// ID the exiting node stores the piece under.
    pub original_piece_id: PieceId,
    /// PUT limit addressed to the replacement node.
    pub addressed_limit: SignedOrderLimit,
    /// Replacement node's dialable address.
    pub target_address: String,
    /// Ephemeral key material the node signs its orders with.
    pub piece_private_key: Vec<u8>,
}

/// Satellite → node messages on the graceful-exit stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SatelliteMessage {
    /// The exit loop has not finished collecting this node's pieces.
    NotReady,
    /// Transfer one piece to a replacement node.
    TransferPiece(TransferPiece),
    /// The transfer was verified; the exiting node may drop the piece.
    DeletePiece { original_piece_id: PieceId },
    /// Terminal: exit succeeded. Signed by the satellite.
    ExitCompleted {
        node: NodeId,
        finished_at: DateTime<Utc>,
        signature: Vec<u8>,
    },
    /// Terminal: exit failed. Signed by the satellite.
    ExitFailed {
        node: NodeId,
        reason: ExitFailedReason,
        finished_at: DateTime<Utc>,
        signature: Vec<u8>,
    },
}

impl SatelliteMessage {
    /// Canonical bytes covered by the terminal-message signature.
    pub fn exit_completed_signing_bytes(node: NodeId, finished_at: DateTime<Utc>) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(48);
        bytes.extend_from_slice(b"exit-completed");
        bytes.extend_from_slice(node.as_bytes());
        bytes.extend_from_slice(&finished_at.timestamp_micros().to_be_bytes());
        bytes
    }

    /// Canonical bytes covered by the failure-message signature.
    pub fn exit_failed_signing_bytes(
        node: NodeId,
        reason: ExitFailedReason,
        finished_at: DateTime<Utc>,
    ) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(49);
        bytes.extend_from_slice(b"exit-failed");
        bytes.extend_from_slice(node.as_bytes());
        bytes.push(reason as u8);
        bytes.extend_from_slice(&finished_at.timestamp_micros().to_be_bytes());
        bytes
    }
}

/// Node → satellite messages on the graceful-exit stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeMessage {
    /// The piece now lives on the replacement node.
    Succeeded {
        original_piece_id: PieceId,
        /// Hash record signed by the exiting node's identity key.
        original_hash: StorageNodeHash,
        /// Hash record signed by the replacement node's identity key.
        replacement_hash: StorageNodeHash,
    },
    /// The transfer failed.
    Failed {
        original_piece_id: PieceId,
        code: TransferFailureCode,
    },
}
