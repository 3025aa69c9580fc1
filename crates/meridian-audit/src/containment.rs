//! Pending audits for contained nodes.

use std::collections::HashMap;
use std::sync::Arc;

use meridian_reputation::ReputationService;
use meridian_types::{NodeId, PieceId, SegmentPosition, StreamId};
use tokio::sync::Mutex;
use tracing::debug;

/// A deferred audit: this node still owes proof for this share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAudit {
    pub node: NodeId,
    pub stream_id: StreamId,
    pub position: SegmentPosition,
    pub piece_id: PieceId,
    pub stripe_index: u32,
    /// SHA-256 of the share the node must produce.
    pub expected_share_hash: [u8; 32],
    /// Reverify visits so far.
    pub reverify_count: u32,
}

/// Store of at most one pending audit per node.
///
/// Incrementing sets the node's contained flag in reputation; deleting
/// clears it. Nothing else touches that flag.
pub struct Containment {
    reputation: Arc<ReputationService>,
    pending: Mutex<HashMap<NodeId, PendingAudit>>,
}

impl Containment {
    pub fn new(reputation: Arc<ReputationService>) -> Self {
        Self {
            reputation,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, node: NodeId) -> Option<PendingAudit> {
        self.pending.lock().await.get(&node).cloned()
    }

    pub async fn all(&self) -> Vec<PendingAudit> {
        self.pending.lock().await.values().cloned().collect()
    }

    /// Inserts a pending audit, or bumps the reverify count of the
    /// existing one for the same piece.
    pub async fn increment_pending(&self, pending: PendingAudit) {
        {
            let mut map = self.pending.lock().await;
            match map.get_mut(&pending.node) {
                Some(existing) if existing.piece_id == pending.piece_id => {
                    existing.reverify_count += 1;
                }
                _ => {
                    // A different piece replaces the previous entry; one
                    // outstanding audit per node.
                    map.insert(pending.node, pending.clone());
                }
            }
        }
        debug!(node = %pending.node, "node contained pending reverification");
        self.reputation.set_contained(pending.node, true).await;
    }

    /// Removes the node's pending audit. Returns whether one existed.
    pub async fn delete(&self, node: NodeId) -> bool {
        let existed = self.pending.lock().await.remove(&node).is_some();
        if existed {
            self.reputation.set_contained(node, false).await;
        }
        existed
    }
}
