//! Repair checker: segment-loop observer plus driving service.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use meridian_metabase::{Segment, SegmentLoop, SegmentObserver};
use meridian_overlay::{ReliabilityCache, ReliabilitySnapshot};
use tracing::debug;

use crate::config::RepairConfig;
use crate::error::Result;
use crate::queue::{InjuredSegment, RepairQueue};

/// Counters exposed by the checker.
#[derive(Debug, Default)]
pub struct CheckerStats {
    pub checked: AtomicU64,
    pub injured: AtomicU64,
    /// Segments with fewer than `required` healthy pieces; not enqueued.
    pub irreparable: AtomicU64,
}

/// Classifies one pass worth of segments against a reliability snapshot.
pub struct CheckerObserver {
    snapshot: Arc<ReliabilitySnapshot>,
    config: RepairConfig,
    injured: Vec<InjuredSegment>,
    checked: u64,
    irreparable: u64,
}

impl CheckerObserver {
    pub fn new(snapshot: Arc<ReliabilitySnapshot>, config: RepairConfig) -> Self {
        Self {
            snapshot,
            config,
            injured: Vec::new(),
            checked: 0,
            irreparable: 0,
        }
    }

    fn classify(&mut self, segment: &Segment) {
        self.checked += 1;

        let mut missing = 0u16;
        let mut excluded = 0u16;
        for piece in &segment.pieces {
            if !self.snapshot.is_reliable(piece.node) {
                missing += 1;
            } else if self.snapshot.in_excluded_country(piece.node) {
                excluded += 1;
            }
        }
        let healthy = segment.pieces.len() as u16 - missing - excluded;
        let threshold = self.config.repair_threshold(&segment.redundancy);

        if healthy < segment.redundancy.required {
            self.irreparable += 1;
        } else if healthy <= threshold {
            self.injured.push(InjuredSegment {
                stream_id: segment.stream_id,
                position: segment.position,
                health: healthy,
                inserted_at: Utc::now(),
            });
        }
    }
}

impl SegmentObserver for CheckerObserver {
    fn on_segment(&mut self, segment: &Segment) {
        self.classify(segment);
    }
}

/// Periodic service: snapshot, ride the loop, enqueue the injured.
pub struct Checker {
    segment_loop: Arc<SegmentLoop>,
    cache: Arc<ReliabilityCache>,
    queue: Arc<RepairQueue>,
    config: RepairConfig,
    stats: Arc<CheckerStats>,
}

impl Checker {
    pub fn new(
        segment_loop: Arc<SegmentLoop>,
        cache: Arc<ReliabilityCache>,
        queue: Arc<RepairQueue>,
        config: RepairConfig,
        stats: Arc<CheckerStats>,
    ) -> Self {
        Self {
            segment_loop,
            cache,
            queue,
            config,
            stats,
        }
    }

    /// One checker pass.
    pub async fn run_once(&self) -> Result<()> {
        let snapshot = self.cache.snapshot(None).await?;
        let observer = CheckerObserver::new(snapshot, self.config.clone());
        let (observer, _stats) = self.segment_loop.join(observer).await?;

        let mut enqueued = 0usize;
        for injured in observer.injured {
            if self.queue.insert(injured) {
                enqueued += 1;
            }
        }
        self.stats.checked.fetch_add(observer.checked, Ordering::Relaxed);
        self.stats
            .injured
            .fetch_add(enqueued as u64, Ordering::Relaxed);
        self.stats
            .irreparable
            .fetch_add(observer.irreparable, Ordering::Relaxed);
        debug!(
            checked = observer.checked,
            enqueued,
            irreparable = observer.irreparable,
            "checker pass complete"
        );
        Ok(())
    }
}
