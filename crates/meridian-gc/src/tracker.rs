//! Segment-loop observer building per-node filters.

use std::collections::HashMap;

use meridian_metabase::{Segment, SegmentObserver};
use meridian_types::NodeId;

use crate::bloom::BloomFilter;
use crate::config::GcConfig;

/// Accumulates every live piece ID into its holder's Bloom filter.
///
/// Filters are sized from the node's last-known piece count; the exact
/// count seen during the pass is kept as the next cycle's sizing input.
pub struct GcObserver {
    config: GcConfig,
    last_counts: HashMap<NodeId, u64>,
    filters: HashMap<NodeId, BloomFilter>,
    seen: HashMap<NodeId, u64>,
}

impl GcObserver {
    pub fn new(config: GcConfig, last_counts: HashMap<NodeId, u64>) -> Self {
        Self {
            config,
            last_counts,
            filters: HashMap::new(),
            seen: HashMap::new(),
        }
    }

    pub fn filters(&self) -> &HashMap<NodeId, BloomFilter> {
        &self.filters
    }

    /// Per-node filters and observed piece counts.
    pub fn into_parts(self) -> (HashMap<NodeId, BloomFilter>, HashMap<NodeId, u64>) {
        (self.filters, self.seen)
    }
}

impl SegmentObserver for GcObserver {
    fn on_segment(&mut self, segment: &Segment) {
        for piece in &segment.pieces {
            let piece_id = segment.root_piece_id.derive(piece.node, piece.number);
            let filter = self.filters.entry(piece.node).or_insert_with(|| {
                let expected = self
                    .last_counts
                    .get(&piece.node)
                    .copied()
                    .unwrap_or(self.config.default_piece_count);
                BloomFilter::optimal(expected, self.config.false_positive_rate)
            });
            filter.add(&piece_id);
            *self.seen.entry(piece.node).or_insert(0) += 1;
        }
    }
}
