//! Share challenges and response classification.

use std::sync::Arc;

use chrono::Utc;
use meridian_erasure::Strategy;
use meridian_metabase::{Metabase, MetabaseError};
use meridian_orders::{LimitedNode, OrderService, PiecePrivateKey};
use meridian_piecestore::{NodeClient, PieceStoreError};
use meridian_types::NodeId;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::AuditConfig;
use crate::containment::{Containment, PendingAudit};
use crate::error::Result;
use crate::report::AuditReport;
use crate::reservoir::AuditItem;

/// One fetched share.
#[derive(Debug, Clone)]
struct FetchedShare {
    node: NodeId,
    piece_number: u16,
    data: Vec<u8>,
}

/// Challenges segment holders and classifies their answers.
pub struct Verifier {
    metabase: Arc<Metabase>,
    orders: Arc<OrderService>,
    client: Arc<dyn NodeClient>,
    containment: Arc<Containment>,
    config: AuditConfig,
}

impl Verifier {
    pub fn new(
        metabase: Arc<Metabase>,
        orders: Arc<OrderService>,
        client: Arc<dyn NodeClient>,
        containment: Arc<Containment>,
        config: AuditConfig,
    ) -> Self {
        Self {
            metabase,
            orders,
            client,
            containment,
            config,
        }
    }

    /// Audits one queued stripe.
    ///
    /// A segment that is gone, expired, or modified since queue admission
    /// is skipped without reputation effects.
    pub async fn verify(&self, item: &AuditItem) -> Result<AuditReport> {
        let now = Utc::now();
        let segment = match self
            .metabase
            .get_segment_by_position(item.stream_id, item.position)
            .await
        {
            Ok(segment) => segment,
            Err(MetabaseError::NotFound { .. }) => {
                debug!(stream = %item.stream_id, "segment deleted before audit, skipping");
                return Ok(AuditReport::default());
            }
            Err(err) => return Err(err.into()),
        };
        if segment.is_expired(now) {
            return Ok(AuditReport::default());
        }
        let stripes = segment.redundancy.stripe_count(segment.encrypted_size);
        if u64::from(item.stripe_index) >= stripes {
            debug!(stream = %item.stream_id, "stripe out of range, segment modified; skipping");
            return Ok(AuditReport::default());
        }

        let share_size = segment.redundancy.share_size;
        let (limits, piece_key) = self
            .orders
            .create_audit_limits(
                segment.root_piece_id,
                segment.pieces.as_slice(),
                u64::from(share_size),
                now,
            )
            .await?;

        let required = usize::from(segment.redundancy.required);
        let responses = self
            .fetch_shares(&limits, &piece_key, item.stripe_index, share_size, required)
            .await;

        // Altered-segment check: a concurrent repair or delete voids this
        // audit entirely.
        match self
            .metabase
            .get_segment_by_position(item.stream_id, item.position)
            .await
        {
            Ok(current) if current.pieces == segment.pieces => {}
            _ => {
                debug!(stream = %item.stream_id, "segment changed during audit, discarding");
                return Ok(AuditReport::default());
            }
        }

        let mut report = AuditReport::default();
        let mut successes: Vec<FetchedShare> = Vec::new();
        let mut contained: Vec<(NodeId, u16)> = Vec::new();
        for (limited, outcome) in responses {
            match outcome {
                Ok(data) => {
                    if data.len() == share_size as usize {
                        successes.push(FetchedShare {
                            node: limited.node.id,
                            piece_number: limited.piece_number,
                            data,
                        });
                    } else {
                        // Short read.
                        report.failures.push(limited.node.id);
                    }
                }
                Err(PieceStoreError::Contained) => contained.push((limited.node.id, limited.piece_number)),
                Err(err) => match err.audit_outcome() {
                    meridian_types::AuditOutcome::Offline => report.offlines.push(limited.node.id),
                    meridian_types::AuditOutcome::Failure => report.failures.push(limited.node.id),
                    _ => report.unknowns.push(limited.node.id),
                },
            }
        }

        if successes.len() < required {
            warn!(
                stream = %item.stream_id,
                have = successes.len(),
                required,
                "not enough shares to verify stripe"
            );
            return Ok(AuditReport {
                not_enough_shares: true,
                ..AuditReport::default()
            });
        }

        let strategy = Strategy::new(segment.redundancy)?;
        let Some((rebuilt, bad)) = locate_bad_shares(&strategy, &successes)? else {
            // Shares are mutually inconsistent beyond what rotation can
            // attribute; emit nothing rather than blame the wrong nodes.
            warn!(stream = %item.stream_id, "unattributable share corruption, skipping");
            return Ok(AuditReport {
                not_enough_shares: true,
                ..AuditReport::default()
            });
        };

        for (index, share) in successes.iter().enumerate() {
            if bad.contains(&index) {
                report.failures.push(share.node);
            } else {
                report.successes.push(share.node);
            }
        }

        for (node, piece_number) in contained {
            let expected = &rebuilt[usize::from(piece_number)];
            report.pending_audits.push(PendingAudit {
                node,
                stream_id: item.stream_id,
                position: item.position,
                piece_id: segment.root_piece_id.derive(node, piece_number),
                stripe_index: item.stripe_index,
                expected_share_hash: share_hash(expected),
                reverify_count: 0,
            });
        }

        Ok(report)
    }

    /// Revisits one contained node for the share it still owes.
    pub async fn reverify(&self, pending: &PendingAudit) -> Result<AuditReport> {
        let now = Utc::now();
        let segment = match self
            .metabase
            .get_segment_by_position(pending.stream_id, pending.position)
            .await
        {
            Ok(segment) => segment,
            Err(MetabaseError::NotFound { .. }) => {
                self.containment.delete(pending.node).await;
                return Ok(AuditReport::default());
            }
            Err(err) => return Err(err.into()),
        };

        // The pending audit only binds while the node still holds the
        // same piece of the same segment.
        let piece = segment
            .pieces
            .iter()
            .find(|piece| piece.node == pending.node)
            .copied();
        let still_bound = piece.is_some_and(|piece| {
            segment.root_piece_id.derive(pending.node, piece.number) == pending.piece_id
        });
        let Some(piece) = piece.filter(|_| still_bound) else {
            self.containment.delete(pending.node).await;
            return Ok(AuditReport::default());
        };

        let share_size = segment.redundancy.share_size;
        let (limits, piece_key) = self
            .orders
            .create_audit_limits(
                segment.root_piece_id,
                &[piece],
                u64::from(share_size),
                now,
            )
            .await?;
        let Some(limited) = limits.into_iter().next() else {
            // Node vanished from the directory; nothing to prove anymore.
            self.containment.delete(pending.node).await;
            return Ok(AuditReport::default());
        };

        let outcome = tokio::time::timeout(
            self.config.share_timeout,
            self.client.download_share(
                &limited.node,
                &limited.limit,
                &piece_key,
                pending.stripe_index,
                share_size,
            ),
        )
        .await
        .unwrap_or(Err(PieceStoreError::Timeout));

        let mut report = AuditReport::default();
        match outcome {
            Ok(data) => {
                self.containment.delete(pending.node).await;
                if data.len() == share_size as usize && share_hash(&data) == pending.expected_share_hash
                {
                    report.successes.push(pending.node);
                } else {
                    report.failures.push(pending.node);
                }
            }
            Err(PieceStoreError::NotFound | PieceStoreError::Verification(_)) => {
                self.containment.delete(pending.node).await;
                report.failures.push(pending.node);
            }
            Err(err) => {
                if pending.reverify_count + 1 >= self.config.max_reverify_count {
                    // Out of chances.
                    self.containment.delete(pending.node).await;
                    report.failures.push(pending.node);
                } else {
                    self.containment.increment_pending(pending.clone()).await;
                    match err.audit_outcome() {
                        // Still deferred; the debt itself is not evidence.
                        meridian_types::AuditOutcome::Contained => {}
                        meridian_types::AuditOutcome::Unknown => report.unknowns.push(pending.node),
                        _ => report.offlines.push(pending.node),
                    }
                }
            }
        }
        Ok(report)
    }

    /// Requests one share from every holder, at most `required` in flight.
    async fn fetch_shares(
        &self,
        limits: &[LimitedNode],
        piece_key: &PiecePrivateKey,
        stripe_index: u32,
        share_size: u32,
        required: usize,
    ) -> Vec<(LimitedNode, std::result::Result<Vec<u8>, PieceStoreError>)> {
        let throttle = Arc::new(Semaphore::new(required.max(1)));
        let mut join_set: JoinSet<(LimitedNode, std::result::Result<Vec<u8>, PieceStoreError>)> =
            JoinSet::new();

        for limited in limits {
            let limited = limited.clone();
            let piece_key = piece_key.clone();
            let client = self.client.clone();
            let throttle = throttle.clone();
            let timeout = self.config.share_timeout;
            join_set.spawn(async move {
                let _permit = throttle.acquire_owned().await.expect("semaphore open");
                let outcome = tokio::time::timeout(
                    timeout,
                    client.download_share(
                        &limited.node,
                        &limited.limit,
                        &piece_key,
                        stripe_index,
                        share_size,
                    ),
                )
                .await
                .unwrap_or(Err(PieceStoreError::Timeout));
                (limited, outcome)
            });
        }

        let mut responses = Vec::with_capacity(limits.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(response) => responses.push(response),
                Err(err) => warn!(%err, "share fetch task panicked"),
            }
        }
        responses
    }
}

/// Finds shares inconsistent with the stripe the honest majority encodes.
///
/// Rebuilds the stripe from `required` of the fetched shares and compares
/// everyone against the result. A corrupt share inside the chosen basis
/// makes many honest shares mismatch, so every rotation of the basis is
/// tried and the assignment blaming the fewest shares wins: that is the
/// stripe consistent with the largest subset. Returns the rebuilt stripe
/// and the indices of bad shares, or `None` when no basis produces a
/// consistent assignment.
fn locate_bad_shares(
    strategy: &Strategy,
    shares: &[FetchedShare],
) -> Result<Option<(Vec<Vec<u8>>, Vec<usize>)>> {
    let required = usize::from(strategy.scheme().required);
    let total = usize::from(strategy.scheme().total);

    let mut best: Option<(Vec<Vec<u8>>, Vec<usize>)> = None;
    let mut order: Vec<usize> = (0..shares.len()).collect();
    for _ in 0..shares.len() {
        let chosen = &order[..required];
        let mut stripe: Vec<Option<Vec<u8>>> = vec![None; total];
        for &index in chosen {
            let share = &shares[index];
            stripe[usize::from(share.piece_number)] = Some(share.data.clone());
        }
        let rebuilt = strategy.rebuild_stripe(&stripe)?;

        let mismatched: Vec<usize> = shares
            .iter()
            .enumerate()
            .filter(|(_, share)| rebuilt[usize::from(share.piece_number)] != share.data)
            .map(|(index, _)| index)
            .collect();

        let consistent = mismatched.iter().all(|index| !chosen.contains(index));
        if consistent
            && best
                .as_ref()
                .is_none_or(|(_, best_mismatched)| mismatched.len() < best_mismatched.len())
        {
            let done = mismatched.is_empty();
            best = Some((rebuilt, mismatched));
            if done {
                break;
            }
        }
        order.rotate_left(1);
    }
    Ok(best)
}

/// SHA-256 of a share; the unit containment stores and checks.
pub fn share_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
