//! Segment-loop observer that samples audit candidates.

use std::collections::HashMap;

use meridian_metabase::{Segment, SegmentObserver};
use meridian_types::NodeId;
use rand::Rng;
use rand::rngs::StdRng;

use crate::reservoir::{AuditItem, Reservoir};

/// Fills one reservoir per holder while riding a segment-loop pass.
///
/// For each remote segment one stripe is drawn at random, and the same
/// (segment, stripe) candidate is offered to every holder's reservoir, so
/// a node's audit probability tracks how many pieces it holds. Copy
/// segments are ignored: they share their ancestor's pieces, and sampling
/// them too would challenge the same bytes twice.
pub struct Collector {
    slots: usize,
    rng: StdRng,
    reservoirs: HashMap<NodeId, Reservoir>,
}

impl Collector {
    pub fn new(slots: usize, rng: StdRng) -> Self {
        Self {
            slots,
            rng,
            reservoirs: HashMap::new(),
        }
    }

    /// Hands back the per-node samples.
    pub fn into_reservoirs(self) -> HashMap<NodeId, Reservoir> {
        self.reservoirs
    }

    pub fn reservoirs(&self) -> &HashMap<NodeId, Reservoir> {
        &self.reservoirs
    }
}

impl SegmentObserver for Collector {
    fn on_segment(&mut self, segment: &Segment) {
        if segment.is_copy() {
            return;
        }
        let stripes = segment.redundancy.stripe_count(segment.encrypted_size);
        let stripe_index = self.rng.gen_range(0..stripes.max(1)) as u32;
        let item = AuditItem {
            stream_id: segment.stream_id,
            position: segment.position,
            stripe_index,
        };
        for piece in &segment.pieces {
            self.reservoirs
                .entry(piece.node)
                .or_insert_with(|| Reservoir::new(self.slots))
                .offer(item, &mut self.rng);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use meridian_types::{Piece, PieceId, Pieces, RedundancyScheme, SegmentPosition, StreamId};
    use rand::SeedableRng;

    fn segment(nodes: &[NodeId]) -> Segment {
        Segment {
            stream_id: StreamId::generate(),
            position: SegmentPosition::new(0, 0),
            redundancy: RedundancyScheme {
                required: 2,
                repair: 3,
                optimal: 4,
                total: 4,
                share_size: 64,
            },
            root_piece_id: PieceId::generate(),
            ancestor_stream_id: None,
            encrypted_size: 640,
            pieces: nodes
                .iter()
                .enumerate()
                .map(|(i, &node)| Piece {
                    number: i as u16,
                    node,
                })
                .collect::<Pieces>(),
            created_at: Utc::now(),
            repaired_at: None,
            expires_at: None,
        }
    }

    #[test]
    fn every_holder_gets_the_candidate() {
        let nodes = [NodeId::generate(), NodeId::generate(), NodeId::generate()];
        let mut collector = Collector::new(3, StdRng::seed_from_u64(1));
        collector.on_segment(&segment(&nodes));

        let reservoirs = collector.into_reservoirs();
        assert_eq!(reservoirs.len(), 3);
        for node in &nodes {
            assert_eq!(reservoirs[node].len(), 1);
        }
    }

    #[test]
    fn copy_segments_are_ignored() {
        let nodes = [NodeId::generate(), NodeId::generate()];
        let mut collector = Collector::new(3, StdRng::seed_from_u64(2));

        let mut copy = segment(&nodes);
        copy.ancestor_stream_id = Some(StreamId::generate());
        collector.on_segment(&copy);
        assert!(collector.reservoirs().is_empty());

        // The ancestor itself is still sampled.
        collector.on_segment(&segment(&nodes));
        assert_eq!(collector.reservoirs().len(), 2);
    }

    #[test]
    fn stripe_index_stays_in_range() {
        let nodes = [NodeId::generate()];
        let mut collector = Collector::new(8, StdRng::seed_from_u64(9));
        let segment = segment(&nodes);
        // 640 bytes / (2 * 64) per stripe = 5 stripes.
        for _ in 0..50 {
            collector.on_segment(&segment);
        }
        for reservoir in collector.reservoirs().values() {
            for item in reservoir.items() {
                assert!(item.stripe_index < 5);
            }
        }
    }
}
