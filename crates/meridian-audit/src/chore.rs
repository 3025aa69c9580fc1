//! Collection chore: reservoirs → queue.

use std::collections::HashSet;
use std::sync::Arc;

use meridian_metabase::SegmentLoop;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use crate::collector::Collector;
use crate::config::AuditConfig;
use crate::error::Result;
use crate::queue::AuditQueue;
use crate::reservoir::AuditItem;

/// Periodically rides the segment loop and refills the audit queue.
pub struct AuditChore {
    segment_loop: Arc<SegmentLoop>,
    queue: Arc<AuditQueue>,
    config: AuditConfig,
}

impl AuditChore {
    pub fn new(segment_loop: Arc<SegmentLoop>, queue: Arc<AuditQueue>, config: AuditConfig) -> Self {
        Self {
            segment_loop,
            queue,
            config,
        }
    }

    /// One collection pass.
    pub async fn run_once(&self) -> Result<()> {
        let collector = Collector::new(self.config.reservoir_slots, StdRng::from_entropy());
        let (collector, stats) = self.segment_loop.join(collector).await?;

        // One queue item audits every holder of its stripe, so the same
        // candidate sampled into several reservoirs collapses to one.
        let unique: HashSet<AuditItem> = collector
            .into_reservoirs()
            .into_values()
            .flat_map(|reservoir| reservoir.take())
            .collect();
        let mut items: Vec<AuditItem> = unique.into_iter().collect();
        items.shuffle(&mut rand::thread_rng());

        debug!(
            items = items.len(),
            segments = stats.segments,
            "audit collection pass complete"
        );
        self.queue.push_batch(items);
        Ok(())
    }
}
