//! In-memory segment catalogue.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use meridian_types::{Pieces, RedundancyScheme, SegmentPosition, StreamId};

use crate::error::{MetabaseError, Result};
use crate::segment::Segment;

/// Compare-and-set request against a segment's piece set.
#[derive(Debug, Clone)]
pub struct UpdateSegmentPieces {
    pub stream_id: StreamId,
    pub position: SegmentPosition,
    /// The piece set the writer last observed. The update is rejected with
    /// [`MetabaseError::Changed`] if the row no longer matches.
    pub old_pieces: Pieces,
    pub new_pieces: Pieces,
    pub new_redundancy: Option<RedundancyScheme>,
    pub new_repaired_at: Option<DateTime<Utc>>,
}

/// The satellite's segment catalogue.
///
/// Rows are keyed by `(stream, position)` and scanned in key order by the
/// segment loop. All mutation goes through typed operations; the piece-set
/// invariants from `meridian-types` are enforced on every write.
#[derive(Debug, Default)]
pub struct Metabase {
    segments: Mutex<BTreeMap<(StreamId, u64), Segment>>,
}

impl Metabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new segment row.
    pub async fn insert_segment(&self, segment: Segment) -> Result<()> {
        segment.pieces.validate(segment.redundancy.total)?;
        let key = (segment.stream_id, segment.position.encode());
        let mut segments = self.segments.lock().expect("metabase lock poisoned");
        if segments.contains_key(&key) {
            return Err(MetabaseError::AlreadyExists {
                stream: segment.stream_id,
                position: segment.position,
            });
        }
        segments.insert(key, segment);
        Ok(())
    }

    /// Fetches a segment row.
    pub async fn get_segment_by_position(
        &self,
        stream: StreamId,
        position: SegmentPosition,
    ) -> Result<Segment> {
        self.segments
            .lock()
            .expect("metabase lock poisoned")
            .get(&(stream, position.encode()))
            .cloned()
            .ok_or(MetabaseError::NotFound { stream, position })
    }

    /// Atomically swaps a segment's piece set.
    ///
    /// Exactly one of two concurrent updates with the same `old_pieces`
    /// precondition succeeds; the other observes [`MetabaseError::Changed`]
    /// and is expected to drop its work item.
    pub async fn update_segment_pieces(&self, req: UpdateSegmentPieces) -> Result<()> {
        let mut segments = self.segments.lock().expect("metabase lock poisoned");
        let segment = segments
            .get_mut(&(req.stream_id, req.position.encode()))
            .ok_or(MetabaseError::NotFound {
                stream: req.stream_id,
                position: req.position,
            })?;

        if segment.pieces != req.old_pieces {
            return Err(MetabaseError::Changed {
                stream: req.stream_id,
                position: req.position,
            });
        }

        let redundancy = req.new_redundancy.unwrap_or(segment.redundancy);
        req.new_pieces.validate(redundancy.total)?;

        segment.pieces = req.new_pieces;
        segment.redundancy = redundancy;
        if req.new_repaired_at.is_some() {
            segment.repaired_at = req.new_repaired_at;
        }
        Ok(())
    }

    /// Deletes a segment row. Returns whether a row existed.
    pub async fn delete_segment(&self, stream: StreamId, position: SegmentPosition) -> bool {
        self.segments
            .lock()
            .expect("metabase lock poisoned")
            .remove(&(stream, position.encode()))
            .is_some()
    }

    /// Lists up to `limit` segments starting strictly after `cursor`.
    ///
    /// Returns the batch and the cursor to resume from, if more rows
    /// remain. This is the range-scan surface the segment loop iterates.
    pub async fn list_segments(
        &self,
        cursor: Option<(StreamId, u64)>,
        limit: usize,
    ) -> (Vec<Segment>, Option<(StreamId, u64)>) {
        let segments = self.segments.lock().expect("metabase lock poisoned");
        let iter: Box<dyn Iterator<Item = (&(StreamId, u64), &Segment)>> = match cursor {
            Some(cursor) => Box::new(
                segments
                    .range((
                        std::ops::Bound::Excluded(cursor),
                        std::ops::Bound::Unbounded,
                    ))
                    .map(|(k, v)| (k, v)),
            ),
            None => Box::new(segments.iter()),
        };

        let batch: Vec<(StreamId, u64, Segment)> = iter
            .take(limit)
            .map(|(&(stream, pos), segment)| (stream, pos, segment.clone()))
            .collect();

        let next = if batch.len() == limit {
            batch.last().map(|(stream, pos, _)| (*stream, *pos))
        } else {
            None
        };
        (batch.into_iter().map(|(_, _, s)| s).collect(), next)
    }

    /// Number of segment rows in the catalogue.
    pub async fn segment_count(&self) -> usize {
        self.segments.lock().expect("metabase lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_types::{NodeId, Piece, PieceId};

    fn test_segment(pieces: Vec<Piece>) -> Segment {
        Segment {
            stream_id: StreamId::generate(),
            position: SegmentPosition::new(0, 0),
            redundancy: RedundancyScheme {
                required: 2,
                repair: 3,
                optimal: 4,
                total: 4,
                share_size: 256,
            },
            root_piece_id: PieceId::generate(),
            ancestor_stream_id: None,
            encrypted_size: 1024,
            pieces: Pieces::new(pieces),
            created_at: Utc::now(),
            repaired_at: None,
            expires_at: None,
        }
    }

    fn pieces(nodes: &[NodeId]) -> Vec<Piece> {
        nodes
            .iter()
            .enumerate()
            .map(|(i, &node)| Piece {
                number: i as u16,
                node,
            })
            .collect()
    }

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let metabase = Metabase::new();
        let segment = test_segment(pieces(&[NodeId::generate(), NodeId::generate()]));

        metabase.insert_segment(segment.clone()).await.unwrap();
        let fetched = metabase
            .get_segment_by_position(segment.stream_id, segment.position)
            .await
            .unwrap();
        assert_eq!(fetched, segment);
    }

    #[tokio::test]
    async fn get_missing_segment_is_not_found() {
        let metabase = Metabase::new();
        let err = metabase
            .get_segment_by_position(StreamId::generate(), SegmentPosition::new(0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, MetabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn update_pieces_applies_when_precondition_holds() {
        let metabase = Metabase::new();
        let nodes = [NodeId::generate(), NodeId::generate()];
        let segment = test_segment(pieces(&nodes));
        metabase.insert_segment(segment.clone()).await.unwrap();

        let replacement = NodeId::generate();
        let new_pieces = Pieces::new(pieces(&[nodes[0], replacement]));
        let repaired_at = Utc::now();
        metabase
            .update_segment_pieces(UpdateSegmentPieces {
                stream_id: segment.stream_id,
                position: segment.position,
                old_pieces: segment.pieces.clone(),
                new_pieces: new_pieces.clone(),
                new_redundancy: None,
                new_repaired_at: Some(repaired_at),
            })
            .await
            .unwrap();

        let fetched = metabase
            .get_segment_by_position(segment.stream_id, segment.position)
            .await
            .unwrap();
        assert_eq!(fetched.pieces, new_pieces);
        assert_eq!(fetched.repaired_at, Some(repaired_at));
    }

    #[tokio::test]
    async fn update_pieces_rejects_stale_precondition() {
        let metabase = Metabase::new();
        let nodes = [NodeId::generate(), NodeId::generate()];
        let segment = test_segment(pieces(&nodes));
        metabase.insert_segment(segment.clone()).await.unwrap();

        let update = |new_node: NodeId| UpdateSegmentPieces {
            stream_id: segment.stream_id,
            position: segment.position,
            old_pieces: segment.pieces.clone(),
            new_pieces: Pieces::new(pieces(&[nodes[0], new_node])),
            new_redundancy: None,
            new_repaired_at: None,
        };

        // First writer wins.
        metabase
            .update_segment_pieces(update(NodeId::generate()))
            .await
            .unwrap();

        // Second writer with the same precondition observes the conflict.
        let err = metabase
            .update_segment_pieces(update(NodeId::generate()))
            .await
            .unwrap_err();
        assert!(matches!(err, MetabaseError::Changed { .. }));
    }

    #[tokio::test]
    async fn update_pieces_rejects_duplicate_node_placement() {
        let metabase = Metabase::new();
        let nodes = [NodeId::generate(), NodeId::generate()];
        let segment = test_segment(pieces(&nodes));
        metabase.insert_segment(segment.clone()).await.unwrap();

        // Replacing piece 1 with a node that already holds piece 0.
        let err = metabase
            .update_segment_pieces(UpdateSegmentPieces {
                stream_id: segment.stream_id,
                position: segment.position,
                old_pieces: segment.pieces.clone(),
                new_pieces: Pieces::new(vec![
                    Piece {
                        number: 0,
                        node: nodes[0],
                    },
                    Piece {
                        number: 1,
                        node: nodes[0],
                    },
                ]),
                new_redundancy: None,
                new_repaired_at: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MetabaseError::InvalidPieces(_)));
    }

    #[tokio::test]
    async fn list_segments_pages_in_key_order() {
        let metabase = Metabase::new();
        for _ in 0..5 {
            metabase
                .insert_segment(test_segment(pieces(&[NodeId::generate(), NodeId::generate()])))
                .await
                .unwrap();
        }

        let mut seen = 0;
        let mut cursor = None;
        loop {
            let (batch, next) = metabase.list_segments(cursor, 2).await;
            seen += batch.len();
            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, 5);
    }
}
