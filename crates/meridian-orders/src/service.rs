//! The order-limit issuer.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use meridian_overlay::{Overlay, SelectedNode};
use meridian_types::{NodeId, Piece, PieceId};
use serde::{Deserialize, Serialize};

use crate::identity::{PiecePrivateKey, SatelliteIdentity};
use crate::limits::{Action, OrderLimit, SerialNumber, SignedOrderLimit};
use crate::Result;

/// Issuer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrdersConfig {
    /// Lifetime of an issued order limit.
    pub expiration: Duration,
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self {
            expiration: Duration::from_secs(2 * 60 * 60),
        }
    }
}

/// A signed limit addressed to a dialable node.
#[derive(Debug, Clone)]
pub struct LimitedNode {
    pub limit: SignedOrderLimit,
    pub node: SelectedNode,
    /// Piece number the limit covers.
    pub piece_number: u16,
}

/// Result of requesting repair-download limits.
///
/// Nodes the overlay no longer considers reliable are refused a limit and
/// listed in `refused`; the repairer moves them from healthy to unhealthy.
#[derive(Debug)]
pub struct RepairGetLimits {
    pub limits: Vec<LimitedNode>,
    pub refused: Vec<Piece>,
    pub piece_key: PiecePrivateKey,
}

/// Creates signed order limits on behalf of the satellite.
pub struct OrderService {
    config: OrdersConfig,
    identity: Arc<SatelliteIdentity>,
    overlay: Arc<Overlay>,
}

impl OrderService {
    pub fn new(config: OrdersConfig, identity: Arc<SatelliteIdentity>, overlay: Arc<Overlay>) -> Self {
        Self {
            config,
            identity,
            overlay,
        }
    }

    pub fn identity(&self) -> &Arc<SatelliteIdentity> {
        &self.identity
    }

    /// GET_AUDIT limits for every resolvable holder of a segment.
    ///
    /// Holders missing from the directory get no limit; the verifier
    /// never contacts them and they drop out of that audit.
    pub async fn create_audit_limits(
        &self,
        root_piece_id: PieceId,
        pieces: &[Piece],
        share_size: u64,
        now: DateTime<Utc>,
    ) -> Result<(Vec<LimitedNode>, PiecePrivateKey)> {
        let piece_key = PiecePrivateKey::generate();
        let mut limits = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let Ok(record) = self.overlay.get(piece.node).await else {
                continue;
            };
            limits.push(self.limit_for(
                root_piece_id,
                piece.number,
                SelectedNode {
                    id: record.id,
                    address: record.address,
                },
                Action::GetAudit,
                share_size,
                &piece_key,
                now,
            ));
        }
        Ok((limits, piece_key))
    }

    /// GET_REPAIR limits for the healthy pieces of an injured segment.
    pub async fn create_get_repair_limits(
        &self,
        root_piece_id: PieceId,
        healthy: &[Piece],
        piece_size: u64,
        now: DateTime<Utc>,
    ) -> Result<RepairGetLimits> {
        let piece_key = PiecePrivateKey::generate();
        let nodes: Vec<NodeId> = healthy.iter().map(|piece| piece.node).collect();
        let reliable = self.overlay.known_reliable(&nodes, now).await;

        let mut limits = Vec::with_capacity(reliable.len());
        let mut refused = Vec::new();
        for piece in healthy {
            match reliable.iter().find(|node| node.id == piece.node) {
                Some(node) => limits.push(self.limit_for(
                    root_piece_id,
                    piece.number,
                    node.clone(),
                    Action::GetRepair,
                    piece_size,
                    &piece_key,
                    now,
                )),
                None => refused.push(*piece),
            }
        }
        Ok(RepairGetLimits {
            limits,
            refused,
            piece_key,
        })
    }

    /// PUT_REPAIR limits for freshly selected replacement nodes.
    pub async fn create_put_repair_limits(
        &self,
        root_piece_id: PieceId,
        placements: &[(u16, SelectedNode)],
        piece_size: u64,
        now: DateTime<Utc>,
    ) -> Result<(Vec<LimitedNode>, PiecePrivateKey)> {
        let piece_key = PiecePrivateKey::generate();
        let limits = placements
            .iter()
            .map(|(number, node)| {
                self.limit_for(
                    root_piece_id,
                    *number,
                    node.clone(),
                    Action::PutRepair,
                    piece_size,
                    &piece_key,
                    now,
                )
            })
            .collect();
        Ok((limits, piece_key))
    }

    /// PUT limit for one graceful-exit transfer.
    pub async fn create_put_limit(
        &self,
        root_piece_id: PieceId,
        piece_number: u16,
        node: SelectedNode,
        piece_size: u64,
        now: DateTime<Utc>,
    ) -> Result<(LimitedNode, PiecePrivateKey)> {
        let piece_key = PiecePrivateKey::generate();
        let limit = self.limit_for(
            root_piece_id,
            piece_number,
            node,
            Action::Put,
            piece_size,
            &piece_key,
            now,
        );
        Ok((limit, piece_key))
    }

    fn limit_for(
        &self,
        root_piece_id: PieceId,
        piece_number: u16,
        node: SelectedNode,
        action: Action,
        limit_bytes: u64,
        piece_key: &PiecePrivateKey,
        now: DateTime<Utc>,
    ) -> LimitedNode {
        let expiration = chrono::Duration::from_std(self.config.expiration)
            .unwrap_or_else(|_| chrono::Duration::hours(2));
        let limit = OrderLimit {
            serial: SerialNumber::generate(),
            satellite: self.identity.id(),
            node: node.id,
            piece_id: root_piece_id.derive(node.id, piece_number),
            action,
            limit: limit_bytes,
            piece_public_key: piece_key.public_bytes(),
            created_at: now,
            expires_at: now + expiration,
        };
        let signature = self.identity.sign(&limit.signing_bytes()).to_vec();
        LimitedNode {
            limit: SignedOrderLimit { limit, signature },
            node,
            piece_number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_overlay::{CheckInInfo, OverlayConfig};

    async fn setup(nodes: usize) -> (Arc<Overlay>, OrderService, Vec<Piece>) {
        let overlay = Arc::new(Overlay::new(OverlayConfig::default()));
        let mut pieces = Vec::new();
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
            pieces.push(Piece {
                number: i as u16,
                node: id,
            });
        }
        let service = OrderService::new(
            OrdersConfig::default(),
            Arc::new(SatelliteIdentity::generate()),
            overlay.clone(),
        );
        (overlay, service, pieces)
    }

    #[tokio::test]
    async fn audit_limits_cover_every_known_holder() {
        let (_overlay, service, pieces) = setup(4).await;
        let root = PieceId::generate();

        let (limits, _key) = service
            .create_audit_limits(root, &pieces, 256, Utc::now())
            .await
            .unwrap();

        assert_eq!(limits.len(), 4);
        for limited in &limits {
            assert_eq!(limited.limit.limit.action, Action::GetAudit);
            assert_eq!(limited.limit.limit.limit, 256);
            assert_eq!(
                limited.limit.limit.piece_id,
                root.derive(limited.node.id, limited.piece_number)
            );
            limited
                .limit
                .verify(&service.identity().verifying_key(), Utc::now())
                .unwrap();
        }
    }

    #[tokio::test]
    async fn unknown_holders_are_skipped() {
        let (_overlay, service, mut pieces) = setup(2).await;
        pieces.push(Piece {
            number: 9,
            node: NodeId::generate(),
        });

        let (limits, _key) = service
            .create_audit_limits(PieceId::generate(), &pieces, 256, Utc::now())
            .await
            .unwrap();
        assert_eq!(limits.len(), 2);
    }

    #[tokio::test]
    async fn repair_get_limits_refuse_unreliable_nodes() {
        let (overlay, service, pieces) = setup(3).await;
        overlay
            .disqualify_node(
                pieces[1].node,
                meridian_overlay::DisqualificationReason::AuditFailure,
                Utc::now(),
            )
            .await
            .unwrap();

        let result = service
            .create_get_repair_limits(PieceId::generate(), &pieces, 1024, Utc::now())
            .await
            .unwrap();

        assert_eq!(result.limits.len(), 2);
        assert_eq!(result.refused, vec![pieces[1]]);
        assert!(
            result
                .limits
                .iter()
                .all(|limited| limited.limit.limit.action == Action::GetRepair)
        );
    }
}
