//! Exit scheduling chore and its path collector.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use meridian_metabase::{Segment, SegmentLoop, SegmentObserver};
use meridian_overlay::{ExitStatusRequest, Overlay};
use meridian_types::NodeId;
use tracing::{debug, info};

use crate::config::ExitConfig;
use crate::error::Result;
use crate::queue::{TransferItem, TransferQueue};

/// Segment-loop observer collecting every piece held by exiting nodes.
pub struct PathCollector {
    exiting: HashSet<NodeId>,
    items: Vec<TransferItem>,
    collected_at: DateTime<Utc>,
}

impl PathCollector {
    pub fn new(exiting: HashSet<NodeId>, collected_at: DateTime<Utc>) -> Self {
        Self {
            exiting,
            items: Vec::new(),
            collected_at,
        }
    }

    pub fn into_items(self) -> Vec<TransferItem> {
        self.items
    }
}

impl SegmentObserver for PathCollector {
    fn on_segment(&mut self, segment: &Segment) {
        for piece in &segment.pieces {
            if !self.exiting.contains(&piece.node) {
                continue;
            }
            self.items.push(TransferItem {
                node_id: piece.node,
                stream_id: segment.stream_id,
                position: segment.position,
                piece_number: piece.number,
                root_piece_id: segment.root_piece_id,
                durability_ratio: segment.pieces.len() as f64
                    / f64::from(segment.redundancy.total),
                queued_at: self.collected_at,
                order_limit_send_count: 0,
                failed_count: 0,
                last_failed_at: None,
                last_failed_code: None,
            });
        }
    }
}

/// Periodic exit bookkeeping.
///
/// Each pass: run the path collector for exiting nodes whose exit loop
/// has not completed, stamp `loop_completed_at` for them, and fail out
/// any exiting node with no progress inside the inactivity window.
pub struct ExitChore {
    segment_loop: Arc<SegmentLoop>,
    overlay: Arc<Overlay>,
    queue: Arc<TransferQueue>,
    config: ExitConfig,
}

impl ExitChore {
    pub fn new(
        segment_loop: Arc<SegmentLoop>,
        overlay: Arc<Overlay>,
        queue: Arc<TransferQueue>,
        config: ExitConfig,
    ) -> Self {
        Self {
            segment_loop,
            overlay,
            queue,
            config,
        }
    }

    /// One chore pass.
    pub async fn run_once(&self) -> Result<()> {
        let now = Utc::now();
        let exiting = self.overlay.exiting_nodes().await;
        if exiting.is_empty() {
            return Ok(());
        }

        let needs_collection: HashSet<NodeId> = exiting
            .iter()
            .filter(|record| record.exit.loop_completed_at.is_none())
            .map(|record| record.id)
            .collect();

        if !needs_collection.is_empty() {
            let collector = PathCollector::new(needs_collection.clone(), now);
            let (collector, _stats) = self.segment_loop.join(collector).await?;
            let items = collector.into_items();
            debug!(nodes = needs_collection.len(), items = items.len(), "collected exit paths");
            for item in items {
                self.queue.enqueue(item);
            }
            for node in &needs_collection {
                self.overlay
                    .update_exit_status(ExitStatusRequest {
                        loop_completed_at: Some(now),
                        ..ExitStatusRequest::new(*node)
                    })
                    .await?;
            }
        }

        let max_inactive = chrono::Duration::from_std(self.config.max_inactive)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        for record in exiting {
            if needs_collection.contains(&record.id) {
                continue;
            }
            let last_activity = self
                .queue
                .last_activity(record.id)
                .or(record.exit.loop_completed_at)
                .or(record.exit.initiated_at)
                .unwrap_or(now);
            if now.signed_duration_since(last_activity) > max_inactive {
                info!(node = %record.id, "exit inactive too long, failing it out");
                self.overlay
                    .update_exit_status(ExitStatusRequest {
                        finished_at: Some(now),
                        success: Some(false),
                        ..ExitStatusRequest::new(record.id)
                    })
                    .await?;
                self.queue.delete_all(record.id);
            }
        }
        Ok(())
    }
}
