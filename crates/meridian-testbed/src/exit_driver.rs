//! Plays the node side of a graceful-exit session.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use meridian_orders::PiecePrivateKey;
use meridian_overlay::SelectedNode;
use meridian_piecestore::{
    ExitStream, NodeMessage, PieceStoreError, SatelliteMessage, TransferFailureCode, TransferPiece,
};
use meridian_piecestore::NodeClient;
use meridian_types::PieceId;

use crate::network::{TestNetwork, TestNode};

/// How the fake node behaves during its exit session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitBehavior {
    /// Faithfully transfer every ordered piece.
    Transfer,
    /// Answer every order with a failure of the given code.
    Fail(TransferFailureCode),
    /// Never answer; the endpoint's receive timeout fires.
    Silent,
}

/// An [`ExitStream`] whose remote end is a scripted [`TestNode`].
pub struct NodeExitDriver {
    network: Arc<TestNetwork>,
    node: Arc<TestNode>,
    behavior: ExitBehavior,
    inbox: VecDeque<TransferPiece>,
    /// Terminal message received, if the session ended.
    pub terminal: Option<SatelliteMessage>,
    /// Original piece IDs the satellite told the node to drop.
    pub deletes: Vec<PieceId>,
    /// Whether a `NotReady` was received.
    pub not_ready: bool,
}

impl NodeExitDriver {
    pub fn new(network: Arc<TestNetwork>, node: Arc<TestNode>, behavior: ExitBehavior) -> Self {
        Self {
            network,
            node,
            behavior,
            inbox: VecDeque::new(),
            terminal: None,
            deletes: Vec::new(),
            not_ready: false,
        }
    }

    async fn execute_transfer(&self, order: &TransferPiece) -> NodeMessage {
        let Some(data) = self.node.piece_data(order.original_piece_id) else {
            return NodeMessage::Failed {
                original_piece_id: order.original_piece_id,
                code: TransferFailureCode::NotFound,
            };
        };
        let original_hash = self
            .node
            .hash_record(order.original_piece_id)
            .expect("stored piece has a hash record");

        let target = SelectedNode {
            id: order.addressed_limit.limit.node,
            address: order.target_address.clone(),
        };
        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&order.piece_private_key);
        let piece_key = PiecePrivateKey::from_bytes(&key_bytes);

        match self
            .network
            .upload_piece(&target, &order.addressed_limit, &piece_key, &data)
            .await
        {
            Ok(replacement_hash) => NodeMessage::Succeeded {
                original_piece_id: order.original_piece_id,
                original_hash,
                replacement_hash,
            },
            Err(_) => NodeMessage::Failed {
                original_piece_id: order.original_piece_id,
                code: TransferFailureCode::Unknown,
            },
        }
    }
}

#[async_trait]
impl ExitStream for NodeExitDriver {
    async fn send(&mut self, message: SatelliteMessage) -> Result<(), PieceStoreError> {
        match message {
            SatelliteMessage::NotReady => self.not_ready = true,
            SatelliteMessage::TransferPiece(order) => self.inbox.push_back(order),
            SatelliteMessage::DeletePiece { original_piece_id } => {
                self.node.remove_piece(original_piece_id);
                self.deletes.push(original_piece_id);
            }
            terminal @ (SatelliteMessage::ExitCompleted { .. }
            | SatelliteMessage::ExitFailed { .. }) => {
                self.terminal = Some(terminal);
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<NodeMessage>, PieceStoreError> {
        // An empty inbox waits: the satellite's producer may still be
        // sending orders. The endpoint's receive timeout bounds this.
        let order = match self.behavior {
            ExitBehavior::Silent => None,
            _ => self.inbox.pop_front(),
        };
        let Some(order) = order else {
            std::future::pending::<()>().await;
            unreachable!("pending future never resolves")
        };
        match self.behavior {
            ExitBehavior::Silent => unreachable!("silent driver never pops orders"),
            ExitBehavior::Fail(code) => Ok(Some(NodeMessage::Failed {
                original_piece_id: order.original_piece_id,
                code,
            })),
            ExitBehavior::Transfer => Ok(Some(self.execute_transfer(&order).await)),
        }
    }
}
