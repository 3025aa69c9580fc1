//! Segment rows.

use chrono::{DateTime, Utc};
use meridian_types::{PieceId, Pieces, RedundancyScheme, SegmentPosition, StreamId};

/// One erasure-coded unit of a user object.
///
/// A segment with zero pieces is inline: its payload lives in the
/// catalogue row itself and it is never audited, repaired or
/// garbage-collected. A segment created by a server-side object copy
/// records its ancestor's stream and shares that ancestor's pieces; the
/// audit collector skips copies so holders are not sampled twice for the
/// same bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub stream_id: StreamId,
    pub position: SegmentPosition,
    pub redundancy: RedundancyScheme,
    /// Root of the per-node piece ID derivation.
    pub root_piece_id: PieceId,
    /// Stream this segment was copied from, for server-side copies.
    pub ancestor_stream_id: Option<StreamId>,
    /// Encrypted payload size in bytes.
    pub encrypted_size: u64,
    pub pieces: Pieces,
    pub created_at: DateTime<Utc>,
    /// Set by the repairer on every successful commit.
    pub repaired_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Segment {
    pub fn is_inline(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Whether this row is a server-side copy of another segment.
    pub fn is_copy(&self) -> bool {
        self.ancestor_stream_id.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }

    /// Size in bytes of each piece of this segment.
    pub fn piece_size(&self) -> u64 {
        self.redundancy.piece_size(self.encrypted_size)
    }
}
