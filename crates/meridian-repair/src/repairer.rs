//! The segment repairer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use ed25519_dalek::VerifyingKey;
use meridian_erasure::Strategy;
use meridian_metabase::{Metabase, MetabaseError, UpdateSegmentPieces};
use meridian_orders::{LimitedNode, OrderService, PiecePrivateKey, piece_hash};
use meridian_overlay::{NodeSelectionRequest, Overlay, OverlayError, ReliabilityCache};
use meridian_piecestore::{NodeClient, PieceStoreError};
use meridian_reputation::ReputationService;
use meridian_types::{AuditOutcome, NodeId, Piece, Pieces};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::RepairConfig;
use crate::error::Result;
use crate::queue::{InjuredSegment, RepairQueue};

/// Counters exposed by the repairer.
#[derive(Debug, Default)]
pub struct RepairStats {
    /// Commits that brought the segment to at least optimal.
    pub repair_success: AtomicU64,
    /// Commits above threshold but below optimal.
    pub repair_partial: AtomicU64,
    /// Commits that left the segment at or below threshold, and upload
    /// shortfalls.
    pub repair_failed: AtomicU64,
    /// Segments with fewer than `required` retrievable pieces.
    pub irreparable: AtomicU64,
    /// Work items dropped because the segment vanished or changed.
    pub dropped: AtomicU64,
}

/// Outcome classes of one piece download.
#[derive(Debug, Default)]
struct DownloadOutcomes {
    /// Verified piece bytes by piece number.
    fetched: Vec<(Piece, Vec<u8>)>,
    failed: Vec<Piece>,
    offline: Vec<Piece>,
    unknown: Vec<Piece>,
}

/// Drains the injured-segment queue under the no-worse contract.
pub struct SegmentRepairer {
    metabase: Arc<Metabase>,
    overlay: Arc<Overlay>,
    cache: Arc<ReliabilityCache>,
    orders: Arc<OrderService>,
    reputation: Arc<ReputationService>,
    client: Arc<dyn NodeClient>,
    queue: Arc<RepairQueue>,
    config: RepairConfig,
    stats: Arc<RepairStats>,
}

impl SegmentRepairer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metabase: Arc<Metabase>,
        overlay: Arc<Overlay>,
        cache: Arc<ReliabilityCache>,
        orders: Arc<OrderService>,
        reputation: Arc<ReputationService>,
        client: Arc<dyn NodeClient>,
        queue: Arc<RepairQueue>,
        config: RepairConfig,
        stats: Arc<RepairStats>,
    ) -> Self {
        Self {
            metabase,
            overlay,
            cache,
            orders,
            reputation,
            client,
            queue,
            config,
            stats,
        }
    }

    /// Drains the queue; one failing segment never stops the pass.
    ///
    /// Processes at most the number of items queued at entry, so segments
    /// re-queued during the pass (irreparable, upload shortfall) wait for
    /// the next cycle instead of spinning.
    pub async fn run_once(&self) -> Result<()> {
        let mut budget = self.queue.count();
        while budget > 0 {
            budget -= 1;
            let Some(injured) = self.queue.pop() else { break };
            if let Err(err) = self.repair_one(injured).await {
                warn!(stream = %injured.stream_id, %err, "repair failed");
                self.queue.insert(injured);
            }
        }
        Ok(())
    }

    /// Repairs one injured segment end to end.
    pub async fn repair_one(&self, injured: InjuredSegment) -> Result<()> {
        let now = Utc::now();

        // Re-read: the segment may be gone or already repaired.
        let segment = match self
            .metabase
            .get_segment_by_position(injured.stream_id, injured.position)
            .await
        {
            Ok(segment) => segment,
            Err(MetabaseError::NotFound { .. }) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        if segment.is_expired(now) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        // Fresh reliability: the queue entry may be minutes old.
        let snapshot = self.cache.snapshot(None).await?;
        let mut healthy: Vec<Piece> = Vec::new();
        let mut missing: HashSet<NodeId> = HashSet::new();
        let mut excluded_retained = 0usize;
        for piece in &segment.pieces {
            if !snapshot.is_reliable(piece.node) {
                missing.insert(piece.node);
            } else if snapshot.in_excluded_country(piece.node) {
                excluded_retained += 1;
            } else {
                healthy.push(*piece);
            }
        }

        let required = usize::from(segment.redundancy.required);
        let optimal = usize::from(segment.redundancy.optimal);
        let threshold = usize::from(self.config.repair_threshold(&segment.redundancy));

        if healthy.len() < required {
            // Transient hope: keep it queued and try again next cycle.
            info!(stream = %segment.stream_id, healthy = healthy.len(), "segment irreparable");
            self.stats.irreparable.fetch_add(1, Ordering::Relaxed);
            self.queue.insert(injured);
            return Ok(());
        }
        if healthy.len() > threshold {
            debug!(stream = %segment.stream_id, "segment recovered on its own");
            return Ok(());
        }

        let piece_size = segment.piece_size();
        let get_limits = self
            .orders
            .create_get_repair_limits(segment.root_piece_id, &healthy, piece_size, now)
            .await?;
        // Refused nodes are unhealthy for planning but stay in the segment.
        let planned_healthy = get_limits.limits.len();
        if planned_healthy < required {
            self.stats.irreparable.fetch_add(1, Ordering::Relaxed);
            self.queue.insert(injured);
            return Ok(());
        }

        let keys = self.verifying_keys(&get_limits.limits).await;
        let outcomes = self
            .download_pieces(&get_limits.limits, &get_limits.piece_key, piece_size, required, &keys)
            .await;

        if outcomes.fetched.len() < required {
            info!(
                stream = %segment.stream_id,
                fetched = outcomes.fetched.len(),
                "not enough pieces retrievable, leaving segment queued"
            );
            self.stats.irreparable.fetch_add(1, Ordering::Relaxed);
            self.queue.insert(injured);
            return Ok(());
        }

        // The piece set must still be what we planned against.
        match self
            .metabase
            .get_segment_by_position(injured.stream_id, injured.position)
            .await
        {
            Ok(current) if current.pieces == segment.pieces => {}
            _ => {
                debug!(stream = %segment.stream_id, "segment changed under repair, dropping");
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        let strategy = Strategy::new(segment.redundancy)?;
        let mut piece_slots: Vec<Option<Vec<u8>>> = vec![None; usize::from(segment.redundancy.total)];
        for (piece, data) in &outcomes.fetched {
            piece_slots[usize::from(piece.number)] = Some(data.clone());
        }
        let data = strategy.decode(piece_slots, segment.encrypted_size as usize)?;
        let new_shares = strategy.encode(&data)?;

        // Download-phase evidence flows into reputation regardless of how
        // the commit below turns out.
        self.report_outcomes(&outcomes, now).await;

        // Keep everything except unreliable nodes and verified failures.
        let failed_nodes: HashSet<NodeId> = outcomes.failed.iter().map(|piece| piece.node).collect();
        let retained: Vec<Piece> = segment
            .pieces
            .iter()
            .copied()
            .filter(|piece| !missing.contains(&piece.node) && !failed_nodes.contains(&piece.node))
            .collect();
        let retained_healthy = retained
            .iter()
            .filter(|piece| {
                snapshot.is_reliable(piece.node) && !snapshot.in_excluded_country(piece.node)
            })
            .count();

        // Excluded-country pieces count as neither healthy nor missing in
        // the sizing arithmetic, so both terms reduce to the healthy set
        // the issuer granted limits for.
        let min_successful = optimal.saturating_sub(planned_healthy).max(1);
        let excess = (optimal as f64 * (1.0 + self.config.max_excess_rate)).ceil() as usize;
        let mut free_numbers: Vec<u16> = {
            let taken: HashSet<u16> = retained.iter().map(|piece| piece.number).collect();
            (0..segment.redundancy.total)
                .filter(|number| !taken.contains(number))
                .collect()
        };
        let request_count = excess
            .saturating_sub(planned_healthy)
            .min(free_numbers.len());
        free_numbers.truncate(request_count);

        let selection = match self
            .overlay
            .find_storage_nodes_for_upload(
                &NodeSelectionRequest {
                    requested_count: request_count,
                    excluded: segment.pieces.node_ids(),
                },
                now,
            )
            .await
        {
            Ok(selection) => selection,
            Err(OverlayError::NotEnoughNodes { requested, available }) => {
                warn!(stream = %segment.stream_id, requested, available, "not enough repair targets");
                self.stats.repair_failed.fetch_add(1, Ordering::Relaxed);
                self.queue.insert(injured);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let placements: Vec<(u16, meridian_overlay::SelectedNode)> =
            free_numbers.iter().copied().zip(selection).collect();
        let (put_limits, put_key) = self
            .orders
            .create_put_repair_limits(segment.root_piece_id, &placements, piece_size, now)
            .await?;

        let uploaded = self
            .upload_pieces(&put_limits, &put_key, &new_shares, min_successful, &keys)
            .await;
        if uploaded.len() < min_successful {
            warn!(
                stream = %segment.stream_id,
                uploaded = uploaded.len(),
                needed = min_successful,
                "repair upload fell short"
            );
            self.stats.repair_failed.fetch_add(1, Ordering::Relaxed);
            self.queue.insert(injured);
            return Ok(());
        }

        let mut new_pieces: Vec<Piece> = retained;
        new_pieces.extend(uploaded.iter().map(|&(number, node)| Piece { number, node }));
        new_pieces.sort_by_key(|piece| piece.number);
        let new_pieces = Pieces::new(new_pieces);

        match self
            .metabase
            .update_segment_pieces(UpdateSegmentPieces {
                stream_id: segment.stream_id,
                position: segment.position,
                old_pieces: segment.pieces.clone(),
                new_pieces: new_pieces.clone(),
                new_redundancy: None,
                new_repaired_at: Some(now),
            })
            .await
        {
            Ok(()) => {}
            Err(MetabaseError::Changed { .. } | MetabaseError::NotFound { .. }) => {
                debug!(stream = %segment.stream_id, "lost the piece-set race, dropping repair");
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        // Fresh uploads sit on nodes selection just vetted, which may
        // postdate the snapshot; count them directly.
        let healthy_after = retained_healthy + uploaded.len();
        let counter = if healthy_after <= threshold {
            &self.stats.repair_failed
        } else if healthy_after < optimal {
            &self.stats.repair_partial
        } else {
            &self.stats.repair_success
        };
        counter.fetch_add(1, Ordering::Relaxed);
        info!(
            stream = %segment.stream_id,
            position = %segment.position,
            healthy_before = injured.health,
            pieces_after = new_pieces.len(),
            "repaired segment"
        );
        Ok(())
    }

    async fn verifying_keys(&self, limits: &[LimitedNode]) -> HashMap<NodeId, VerifyingKey> {
        let mut keys = HashMap::new();
        for limited in limits {
            if let Ok(record) = self.overlay.get(limited.node.id).await {
                if let Some(key) = record.verifying_key {
                    keys.insert(limited.node.id, key);
                }
            }
        }
        keys
    }

    /// Downloads pieces with at most `required` in flight, cancelling the
    /// long tail once `required` have verified.
    async fn download_pieces(
        &self,
        limits: &[LimitedNode],
        piece_key: &PiecePrivateKey,
        piece_size: u64,
        required: usize,
        keys: &HashMap<NodeId, VerifyingKey>,
    ) -> DownloadOutcomes {
        let throttle = Arc::new(Semaphore::new(required.max(1)));
        let mut join_set: JoinSet<(Piece, std::result::Result<Vec<u8>, PieceStoreError>)> =
            JoinSet::new();

        for limited in limits {
            let limited = limited.clone();
            let piece_key = piece_key.clone();
            let client = self.client.clone();
            let throttle = throttle.clone();
            let timeout = self.config.download_timeout;
            let key = keys.get(&limited.node.id).copied();
            join_set.spawn(async move {
                let piece = Piece {
                    number: limited.piece_number,
                    node: limited.node.id,
                };
                let _permit = throttle.acquire_owned().await.expect("semaphore open");
                let outcome = tokio::time::timeout(
                    timeout,
                    client.download_piece(&limited.node, &limited.limit, &piece_key),
                )
                .await
                .unwrap_or(Err(PieceStoreError::Timeout));

                let verified = outcome.and_then(|(data, node_hash)| {
                    if data.len() as u64 != piece_size {
                        return Err(PieceStoreError::Verification(format!(
                            "piece size {} != {piece_size}",
                            data.len()
                        )));
                    }
                    if node_hash.hash != piece_hash(&data) {
                        return Err(PieceStoreError::Verification("piece hash mismatch".into()));
                    }
                    if let Some(key) = key {
                        node_hash
                            .verify(&key)
                            .map_err(|_| PieceStoreError::Verification("bad hash signature".into()))?;
                    }
                    Ok(data)
                });
                (piece, verified)
            });
        }

        let mut outcomes = DownloadOutcomes::default();
        while let Some(joined) = join_set.join_next().await {
            let Ok((piece, result)) = joined else {
                continue;
            };
            match result {
                Ok(data) => {
                    outcomes.fetched.push((piece, data));
                    if outcomes.fetched.len() >= required {
                        // Long-tail cancellation: enough verified pieces.
                        join_set.abort_all();
                    }
                }
                Err(err) => match err.audit_outcome() {
                    AuditOutcome::Offline => outcomes.offline.push(piece),
                    AuditOutcome::Failure => outcomes.failed.push(piece),
                    _ => outcomes.unknown.push(piece),
                },
            }
        }
        outcomes
    }

    /// Uploads replacement pieces; after the soft deadline the slow tail
    /// is cancelled as soon as `min_successful` uploads have verified.
    async fn upload_pieces(
        &self,
        limits: &[LimitedNode],
        piece_key: &PiecePrivateKey,
        shares: &[Vec<u8>],
        min_successful: usize,
        keys: &HashMap<NodeId, VerifyingKey>,
    ) -> Vec<(u16, NodeId)> {
        let mut join_set: JoinSet<(u16, NodeId, bool)> = JoinSet::new();
        for limited in limits {
            let limited = limited.clone();
            let piece_key = piece_key.clone();
            let client = self.client.clone();
            let data = shares[usize::from(limited.piece_number)].clone();
            let timeout = self.config.upload_timeout;
            let key = keys.get(&limited.node.id).copied();
            join_set.spawn(async move {
                let outcome = tokio::time::timeout(
                    timeout,
                    client.upload_piece(&limited.node, &limited.limit, &piece_key, &data),
                )
                .await
                .unwrap_or(Err(PieceStoreError::Timeout));

                let ok = match outcome {
                    Ok(node_hash) => {
                        node_hash.hash == piece_hash(&data)
                            && key.is_none_or(|key| node_hash.verify(&key).is_ok())
                    }
                    Err(_) => false,
                };
                (limited.piece_number, limited.node.id, ok)
            });
        }

        let deadline = tokio::time::sleep(self.config.upload_timeout);
        tokio::pin!(deadline);
        let mut deadline_passed = false;
        let mut uploaded = Vec::new();

        loop {
            tokio::select! {
                joined = join_set.join_next() => {
                    match joined {
                        None => break,
                        Some(Ok((number, node, true))) => {
                            uploaded.push((number, node));
                            if deadline_passed && uploaded.len() >= min_successful {
                                join_set.abort_all();
                            }
                        }
                        Some(_) => {}
                    }
                }
                () = &mut deadline, if !deadline_passed => {
                    deadline_passed = true;
                    if uploaded.len() >= min_successful {
                        join_set.abort_all();
                    }
                }
            }
        }
        uploaded
    }

    async fn report_outcomes(&self, outcomes: &DownloadOutcomes, now: chrono::DateTime<chrono::Utc>) {
        let buckets: [(Vec<NodeId>, AuditOutcome); 4] = [
            (
                outcomes.fetched.iter().map(|(piece, _)| piece.node).collect(),
                AuditOutcome::Success,
            ),
            (
                outcomes.failed.iter().map(|piece| piece.node).collect(),
                AuditOutcome::Failure,
            ),
            (
                outcomes.offline.iter().map(|piece| piece.node).collect(),
                AuditOutcome::Offline,
            ),
            (
                outcomes.unknown.iter().map(|piece| piece.node).collect(),
                AuditOutcome::Unknown,
            ),
        ];
        for (nodes, outcome) in buckets {
            for node in nodes {
                if let Err(err) = self.reputation.apply_audit(node, outcome, now).await {
                    warn!(node = %node, %err, "repair reputation update failed");
                }
            }
        }
    }

    pub fn stats(&self) -> &Arc<RepairStats> {
        &self.stats
    }
}
