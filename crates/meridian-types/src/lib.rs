//! # meridian-types: Core types for the Meridian satellite
//!
//! This crate contains shared types used across the satellite:
//! - Entity IDs ([`NodeId`], [`StreamId`], [`PieceId`], [`SegmentPosition`])
//! - Redundancy parameters ([`RedundancyScheme`])
//! - Piece placement ([`Piece`], [`Pieces`])
//! - Geography ([`CountryCode`])
//! - Audit classification ([`AuditOutcome`])
//!
//! Everything here is a small value type: cheap to copy or clone, freely
//! passed through queues between subsystems without shared ownership.

use std::collections::HashSet;
use std::fmt::{self, Debug, Display};

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

// ============================================================================
// Node identity
// ============================================================================

/// Length in bytes of node and piece identifiers.
pub const ID_LENGTH: usize = 32;

/// Unique identifier for a storage node.
///
/// Derived from the node's identity key at first check-in and stable for
/// the node's lifetime.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct NodeId([u8; ID_LENGTH]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    /// Generates a random node ID.
    ///
    /// Used by tests and by the testbed when minting fake nodes; real node
    /// IDs arrive through check-in.
    pub fn generate() -> Self {
        let mut bytes = [0u8; ID_LENGTH];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
        Self(bytes)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

// ============================================================================
// Segment identity
// ============================================================================

/// Unique identifier for an object stream.
///
/// A stream groups the ordered segments of a single user object.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct StreamId(Uuid);

impl StreamId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a segment within its stream.
///
/// **Bit layout of the packed encoding**:
/// - Upper 32 bits: `part` (multipart upload part number)
/// - Lower 32 bits: `index` (segment index within the part)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SegmentPosition {
    pub part: u32,
    pub index: u32,
}

impl SegmentPosition {
    pub fn new(part: u32, index: u32) -> Self {
        Self { part, index }
    }

    /// Builds a position from its packed representation.
    pub fn from_encoded(encoded: u64) -> Self {
        Self {
            part: (encoded >> 32) as u32,
            index: (encoded & 0xFFFF_FFFF) as u32,
        }
    }

    /// Packs the position into a single `u64` for ordering and storage.
    pub fn encode(self) -> u64 {
        (u64::from(self.part) << 32) | u64::from(self.index)
    }
}

impl Display for SegmentPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.part, self.index)
    }
}

// ============================================================================
// Piece identity
// ============================================================================

/// Unique identifier for a stored piece.
///
/// Segments carry a single root piece ID; the ID of the piece held by a
/// particular node is derived from the root, the node ID and the piece
/// number. Storage nodes perform the same derivation, so the construction
/// is frozen at the wire level.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PieceId([u8; ID_LENGTH]);

impl PieceId {
    pub fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    /// Generates a random root piece ID for a new segment.
    pub fn generate() -> Self {
        let mut bytes = [0u8; ID_LENGTH];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
        Self(bytes)
    }

    /// Derives the per-node piece ID from a segment's root piece ID.
    ///
    /// HKDF-SHA256 with the root as input keying material and
    /// `node_id || piece_number` (big endian) as the info string. The
    /// output is the 32-byte piece ID the node stores the piece under.
    pub fn derive(&self, node: NodeId, piece_number: u16) -> PieceId {
        let hk = Hkdf::<Sha256>::new(None, &self.0);
        let mut info = [0u8; ID_LENGTH + 4];
        info[..ID_LENGTH].copy_from_slice(node.as_bytes());
        info[ID_LENGTH..].copy_from_slice(&u32::from(piece_number).to_be_bytes());
        let mut out = [0u8; ID_LENGTH];
        hk.expand(&info, &mut out)
            .expect("32 bytes is a valid HKDF output length");
        PieceId(out)
    }
}

impl Display for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceId({self})")
    }
}

// ============================================================================
// Redundancy
// ============================================================================

/// Erasure-coding parameters of a segment.
///
/// A segment is split into stripes of `required * share_size` bytes; each
/// stripe is encoded into `total` shares. Any `required` shares of a
/// stripe reconstruct it. The satellite repairs a segment once it falls
/// to `repair` healthy pieces and tops it back up to `optimal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyScheme {
    /// Shares needed to reconstruct a stripe (`k`).
    pub required: u16,
    /// Healthy-piece count at or below which the segment is repaired.
    pub repair: u16,
    /// Piece count a healthy segment is kept at.
    pub optimal: u16,
    /// Total shares produced per stripe (`n`).
    pub total: u16,
    /// Bytes of one erasure share within a stripe.
    pub share_size: u32,
}

impl RedundancyScheme {
    /// Size of one stripe of original data.
    pub fn stripe_size(&self) -> u64 {
        u64::from(self.share_size) * u64::from(self.required)
    }

    /// Number of stripes needed to hold `encrypted_size` bytes.
    pub fn stripe_count(&self, encrypted_size: u64) -> u64 {
        encrypted_size.div_ceil(self.stripe_size().max(1))
    }

    /// Size in bytes of each stored piece for a segment of
    /// `encrypted_size` bytes.
    pub fn piece_size(&self, encrypted_size: u64) -> u64 {
        self.stripe_count(encrypted_size) * u64::from(self.share_size)
    }
}

// ============================================================================
// Piece placement
// ============================================================================

/// One share of a segment, placed on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    /// Share number within the segment, `0 <= number < total`.
    pub number: u16,
    /// Node holding the share.
    pub node: NodeId,
}

/// Ordered set of a segment's pieces.
///
/// Invariants: piece numbers are unique, node IDs are unique, and the set
/// never exceeds the scheme's `total`. Violations are rejected by
/// [`Pieces::validate`], which the metabase runs on every write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Pieces(Vec<Piece>);

/// Violation of the piece-set invariants.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PiecesError {
    #[error("duplicate piece number {0}")]
    DuplicateNumber(u16),

    #[error("node {0} already holds a piece of this segment")]
    DuplicateNode(NodeId),

    #[error("piece count {count} exceeds redundancy total {total}")]
    TooManyPieces { count: usize, total: u16 },
}

impl Pieces {
    pub fn new(pieces: Vec<Piece>) -> Self {
        Self(pieces)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Piece> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Piece] {
        &self.0
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.0.iter().any(|p| p.node == node)
    }

    pub fn by_number(&self, number: u16) -> Option<&Piece> {
        self.0.iter().find(|p| p.number == number)
    }

    /// Set of node IDs currently referenced by the segment.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.0.iter().map(|p| p.node).collect()
    }

    /// Returns a copy with `piece` appended.
    pub fn with_piece(&self, piece: Piece) -> Pieces {
        let mut pieces = self.0.clone();
        pieces.push(piece);
        pieces.sort_by_key(|p| p.number);
        Pieces(pieces)
    }

    /// Returns a copy without any piece held by `node`.
    pub fn without_node(&self, node: NodeId) -> Pieces {
        Pieces(self.0.iter().copied().filter(|p| p.node != node).collect())
    }

    /// Checks the uniqueness and cardinality invariants.
    pub fn validate(&self, total: u16) -> Result<(), PiecesError> {
        if self.0.len() > usize::from(total) {
            return Err(PiecesError::TooManyPieces {
                count: self.0.len(),
                total,
            });
        }
        let mut numbers = HashSet::new();
        let mut nodes = HashSet::new();
        for piece in &self.0 {
            if !numbers.insert(piece.number) {
                return Err(PiecesError::DuplicateNumber(piece.number));
            }
            if !nodes.insert(piece.node) {
                return Err(PiecesError::DuplicateNode(piece.node));
            }
        }
        Ok(())
    }
}

impl FromIterator<Piece> for Pieces {
    fn from_iter<T: IntoIterator<Item = Piece>>(iter: T) -> Self {
        Pieces(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Pieces {
    type Item = &'a Piece;
    type IntoIter = std::slice::Iter<'a, Piece>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// ============================================================================
// Geography
// ============================================================================

/// ISO 3166-1 alpha-2 country code, upper-cased.
///
/// Used for placement exclusion: pieces on nodes in excluded countries are
/// kept but never counted as healthy for placement decisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CountryCode(String);

impl CountryCode {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Audit classification
// ============================================================================

/// Result of challenging a node for one erasure share.
///
/// This is a closed set: every response a node can produce maps onto
/// exactly one of these variants, and reputation consumes nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditOutcome {
    /// The node returned the share and its hash matched.
    Success,
    /// The node returned wrong data, a short read, or a bad signature.
    Failure,
    /// The node could not be dialed or timed out.
    Offline,
    /// The node returned a non-validation transport error.
    Unknown,
    /// The node deferred the response; a reverify will visit it.
    Contained,
}
