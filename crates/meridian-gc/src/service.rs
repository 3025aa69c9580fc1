//! The garbage-collection service.

use std::sync::Arc;

use chrono::Utc;
use meridian_metabase::SegmentLoop;
use meridian_overlay::{Overlay, SelectedNode};
use meridian_piecestore::{NodeClient, RetainRequest};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::GcConfig;
use crate::error::Result;
use crate::tracker::GcObserver;

/// Rebuilds and ships per-node retain filters, one cycle at a time.
///
/// Nothing carries over between cycles: every pass rebuilds all filters
/// from the live segment set, and a failed send is simply covered by the
/// next cycle's fresh filter.
pub struct GarbageCollector {
    segment_loop: Arc<SegmentLoop>,
    overlay: Arc<Overlay>,
    client: Arc<dyn NodeClient>,
    config: GcConfig,
}

impl GarbageCollector {
    pub fn new(
        segment_loop: Arc<SegmentLoop>,
        overlay: Arc<Overlay>,
        client: Arc<dyn NodeClient>,
        config: GcConfig,
    ) -> Self {
        Self {
            segment_loop,
            overlay,
            client,
            config,
        }
    }

    /// One full collect-and-dispatch cycle. Returns the number of retain
    /// requests delivered.
    pub async fn run_once(&self) -> Result<usize> {
        // Pieces created after this instant are not in the filters, so
        // nodes must not judge them; the skew buffer widens the margin.
        let cycle_start = Utc::now();
        let creation_date = cycle_start
            - chrono::Duration::from_std(self.config.skew_buffer)
                .unwrap_or_else(|_| chrono::Duration::minutes(30));

        let last_counts = self.overlay.piece_counts().await;
        let observer = GcObserver::new(self.config.clone(), last_counts);
        let (observer, stats) = self.segment_loop.join(observer).await?;
        let (filters, seen) = observer.into_parts();
        debug!(
            nodes = filters.len(),
            segments = stats.segments,
            "built retain filters"
        );

        for (&node, &count) in &seen {
            if let Err(err) = self.overlay.update_piece_count(node, count).await {
                warn!(node = %node, %err, "piece count update failed");
            }
        }

        let throttle = Arc::new(Semaphore::new(self.config.concurrent_sends.max(1)));
        let mut join_set: JoinSet<bool> = JoinSet::new();
        for (node_id, filter) in filters {
            let Ok(record) = self.overlay.get(node_id).await else {
                continue;
            };
            let request = RetainRequest {
                creation_date,
                filter: filter.encode(),
            };
            let target = SelectedNode {
                id: node_id,
                address: record.address,
            };
            let client = self.client.clone();
            let throttle = throttle.clone();
            let timeout = self.config.retain_send_timeout;
            join_set.spawn(async move {
                let _permit = throttle.acquire_owned().await.expect("semaphore open");
                match tokio::time::timeout(timeout, client.retain(&target, &request)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(err)) => {
                        warn!(node = %target.id, %err, "retain send failed");
                        false
                    }
                    Err(_) => {
                        warn!(node = %target.id, "retain send timed out");
                        false
                    }
                }
            });
        }

        let mut delivered = 0usize;
        while let Some(joined) = join_set.join_next().await {
            if matches!(joined, Ok(true)) {
                delivered += 1;
            }
        }
        debug!(delivered, "garbage collection cycle complete");
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use meridian_metabase::{LoopConfig, Metabase, Segment};
    use meridian_orders::{PiecePrivateKey, SignedOrderLimit, StorageNodeHash};
    use meridian_overlay::{CheckInInfo, OverlayConfig};
    use meridian_piecestore::PieceStoreError;
    use meridian_types::{NodeId, Piece, PieceId, Pieces, RedundancyScheme, SegmentPosition, StreamId};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingClient {
        retains: Mutex<HashMap<NodeId, RetainRequest>>,
        fail_for: Mutex<Vec<NodeId>>,
    }

    #[async_trait]
    impl NodeClient for RecordingClient {
        async fn upload_piece(
            &self,
            _node: &SelectedNode,
            _limit: &SignedOrderLimit,
            _piece_key: &PiecePrivateKey,
            _data: &[u8],
        ) -> std::result::Result<StorageNodeHash, PieceStoreError> {
            Err(PieceStoreError::Transport("not implemented".into()))
        }

        async fn download_piece(
            &self,
            _node: &SelectedNode,
            _limit: &SignedOrderLimit,
            _piece_key: &PiecePrivateKey,
        ) -> std::result::Result<(Vec<u8>, StorageNodeHash), PieceStoreError> {
            Err(PieceStoreError::Transport("not implemented".into()))
        }

        async fn download_share(
            &self,
            _node: &SelectedNode,
            _limit: &SignedOrderLimit,
            _piece_key: &PiecePrivateKey,
            _stripe_index: u32,
            _share_size: u32,
        ) -> std::result::Result<Vec<u8>, PieceStoreError> {
            Err(PieceStoreError::Transport("not implemented".into()))
        }

        async fn retain(
            &self,
            node: &SelectedNode,
            request: &RetainRequest,
        ) -> std::result::Result<(), PieceStoreError> {
            if self.fail_for.lock().unwrap().contains(&node.id) {
                return Err(PieceStoreError::Dial("down".into()));
            }
            self.retains
                .lock()
                .unwrap()
                .insert(node.id, request.clone());
            Ok(())
        }
    }

    fn segment(nodes: &[NodeId]) -> Segment {
        Segment {
            stream_id: StreamId::generate(),
            position: SegmentPosition::new(0, 0),
            redundancy: RedundancyScheme {
                required: 2,
                repair: 3,
                optimal: 4,
                total: 5,
                share_size: 64,
            },
            root_piece_id: PieceId::generate(),
            ancestor_stream_id: None,
            encrypted_size: 512,
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

    async fn setup(
        segments: usize,
        nodes: usize,
    ) -> (Arc<SegmentLoop>, Arc<Overlay>, Arc<RecordingClient>, Vec<NodeId>, Vec<Segment>) {
        let metabase = Arc::new(Metabase::new());
        let overlay = Arc::new(Overlay::new(OverlayConfig::default()));
        let mut node_ids = Vec::new();
        for i in 0..nodes {
            let id = NodeId::generate();
            overlay
                .update_check_in(
                    CheckInInfo {
                        id,
                        address: format!("10.0.{i}.1:7777"),
                        country: None,
                        verifying_key: None,
                    },
                    Utc::now(),
                )
                .await
                .unwrap();
            node_ids.push(id);
        }
        let mut stored = Vec::new();
        for _ in 0..segments {
            let segment = segment(&node_ids);
            metabase.insert_segment(segment.clone()).await.unwrap();
            stored.push(segment);
        }
        let segment_loop = Arc::new(SegmentLoop::new(metabase, LoopConfig::default()));
        (segment_loop, overlay, Arc::new(RecordingClient::default()), node_ids, stored)
    }

    #[tokio::test]
    async fn cycle_ships_filters_containing_every_live_piece() {
        let (segment_loop, overlay, client, nodes, segments) = setup(3, 4).await;
        let gc = GarbageCollector::new(
            segment_loop.clone(),
            overlay.clone(),
            client.clone(),
            GcConfig::default(),
        );

        let run = tokio::spawn(async move { gc.run_once().await });
        // Drive loop passes until the collector has ridden one.
        while !run.is_finished() {
            segment_loop.run_once().await;
            tokio::task::yield_now().await;
        }
        let delivered = run.await.unwrap().unwrap();
        assert_eq!(delivered, 4);

        let retains = client.retains.lock().unwrap();
        for segment in &segments {
            for piece in &segment.pieces {
                let request = &retains[&piece.node];
                let filter = crate::bloom::BloomFilter::decode(&request.filter).unwrap();
                let id = segment.root_piece_id.derive(piece.node, piece.number);
                assert!(filter.contains(&id));
                assert!(request.creation_date < Utc::now());
            }
        }

        // Observed counts made it into the overlay for next cycle's sizing.
        for node in &nodes {
            assert_eq!(overlay.get(*node).await.unwrap().piece_count, 3);
        }
    }

    #[tokio::test]
    async fn failed_sends_are_not_retried_within_the_cycle() {
        let (segment_loop, overlay, client, nodes, _segments) = setup(2, 3).await;
        client.fail_for.lock().unwrap().push(nodes[0]);
        let gc = GarbageCollector::new(
            segment_loop.clone(),
            overlay,
            client.clone(),
            GcConfig::default(),
        );

        let run = tokio::spawn(async move { gc.run_once().await });
        while !run.is_finished() {
            segment_loop.run_once().await;
            tokio::task::yield_now().await;
        }
        let delivered = run.await.unwrap().unwrap();

        assert_eq!(delivered, 2);
        assert!(!client.retains.lock().unwrap().contains_key(&nodes[0]));
    }
}
