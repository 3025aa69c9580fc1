//! The per-node graceful-exit session.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use meridian_metabase::{Metabase, MetabaseError, UpdateSegmentPieces};
use meridian_orders::{OrderService, StorageNodeHash};
use meridian_overlay::{
    DisqualificationReason, ExitStatusRequest, NodeSelectionRequest, Overlay, OverlayError,
    SelectedNode,
};
use meridian_piecestore::{
    ExitFailedReason, ExitStream, NodeMessage, SatelliteMessage, TransferFailureCode, TransferPiece,
};
use meridian_types::{NodeId, Piece, PieceId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ExitConfig;
use crate::error::{ExitError, Result};
use crate::queue::{TransferItem, TransferQueue};

/// Cadence of the producer task's queue polling.
const PRODUCER_INTERVAL: Duration = Duration::from_millis(100);

/// A transfer order sent to the node and awaiting its answer.
struct PendingTransfer {
    item: TransferItem,
    target: SelectedNode,
    /// Piece ID the replacement node stores under.
    replacement_piece_id: PieceId,
    piece_size: u64,
}

/// Transfer orders in flight, shared between producer and receiver.
type PendingMap = Arc<tokio::sync::Mutex<HashMap<PieceId, PendingTransfer>>>;

/// What to do with one queue row while producing transfer orders.
enum Produced {
    /// Sent to the node; now pending.
    Sent(Box<PendingTransfer>),
    /// Row resolved without a transfer.
    Settled,
    /// Row kept for a later attempt.
    Deferred,
}

/// Producer → receiver handoff.
enum ProducerEvent {
    /// Forward this order to the node.
    Order(SatelliteMessage),
    /// Rows remain but none can be produced right now.
    Stalled,
    /// The producer hit a hard error.
    Failed(ExitError),
}

/// Next thing the receiver acts on.
enum Step {
    Producer(ProducerEvent),
    Node(Option<NodeMessage>),
}

/// How the receive loop ended.
enum SessionEnd {
    /// Queue drained; proceed to `Finishing` with these counters.
    Drained { transferred: u64, failed: u64 },
    /// No terminal decision; progress is durable and the node may
    /// reconnect.
    Suspended,
    /// A terminal `VERIFICATION_FAILED` was already sent.
    Verification,
}

/// Serves graceful-exit sessions.
///
/// At most one session per node runs at a time; a concurrent attempt is
/// rejected at `Opening`. A session walks
/// `Opening → NotReady → Transferring → Finishing`. During `Transferring`
/// two cooperating tasks share a pending-map: a producer polling the
/// transfer queue on a ~100 ms cycle, and the receiver consuming the
/// node's answers on the stream. The receiver ending the session, for
/// any reason, cancels the producer with it.
pub struct ExitEndpoint {
    metabase: Arc<Metabase>,
    overlay: Arc<Overlay>,
    orders: Arc<OrderService>,
    queue: Arc<TransferQueue>,
    config: ExitConfig,
    active: Mutex<HashSet<NodeId>>,
}

impl ExitEndpoint {
    pub fn new(
        metabase: Arc<Metabase>,
        overlay: Arc<Overlay>,
        orders: Arc<OrderService>,
        queue: Arc<TransferQueue>,
        config: ExitConfig,
    ) -> Self {
        Self {
            metabase,
            overlay,
            orders,
            queue,
            config,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Drives one session on the node's inbound stream.
    pub async fn process(&self, node_id: NodeId, stream: &mut dyn ExitStream) -> Result<()> {
        let _session = SessionGuard::acquire(&self.active, node_id)?;
        let now = Utc::now();
        let record = self.overlay.get(node_id).await?;

        // Opening: terminal states short-circuit with a terminal message.
        if record.is_disqualified() {
            let finished_at = record.exit.finished_at.unwrap_or(now);
            stream
                .send(self.signed_exit_failed(node_id, ExitFailedReason::Disqualified, finished_at))
                .await?;
            return Ok(());
        }
        if record.has_exited() {
            let finished_at = record.exit.finished_at.unwrap_or(now);
            let message = if record.exit.success {
                self.signed_exit_completed(node_id, finished_at)
            } else {
                self.signed_exit_failed(
                    node_id,
                    ExitFailedReason::OverallFailurePercentageExceeded,
                    finished_at,
                )
            };
            stream.send(message).await?;
            return Ok(());
        }

        let min_age = chrono::Duration::from_std(self.config.node_min_age)
            .unwrap_or_else(|_| chrono::Duration::days(180));
        if now.signed_duration_since(record.created_at) < min_age {
            return Err(ExitError::IneligibleYoung(node_id));
        }

        // First contact initiates the exit; the chore will collect paths.
        if record.exit.initiated_at.is_none() {
            info!(node = %node_id, "graceful exit initiated");
            self.overlay
                .update_exit_status(ExitStatusRequest {
                    initiated_at: Some(now),
                    ..ExitStatusRequest::new(node_id)
                })
                .await?;
            stream.send(SatelliteMessage::NotReady).await?;
            return Ok(());
        }
        if record.exit.loop_completed_at.is_none() {
            stream.send(SatelliteMessage::NotReady).await?;
            return Ok(());
        }

        self.transfer_loop(node_id, stream).await
    }

    /// `Transferring`: producer task + receiver, cancelled together.
    async fn transfer_loop(&self, node_id: NodeId, stream: &mut dyn ExitStream) -> Result<()> {
        let pending: PendingMap = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
        let (orders_tx, mut orders_rx) = mpsc::channel(self.config.endpoint_batch_size.max(1));

        let producer = TransferProducer {
            metabase: self.metabase.clone(),
            overlay: self.overlay.clone(),
            orders: self.orders.clone(),
            queue: self.queue.clone(),
            config: self.config.clone(),
            node_id,
            pending: pending.clone(),
            orders_tx,
        };
        let producer_task = tokio::spawn(producer.run());

        let outcome = self
            .receive_loop(node_id, stream, &pending, &mut orders_rx)
            .await;
        // Shared cancel: however the receiver ends, the producer dies too.
        producer_task.abort();
        let _ = producer_task.await;

        match outcome? {
            SessionEnd::Drained { transferred, failed } => {
                self.finish(node_id, stream, transferred, failed).await
            }
            SessionEnd::Suspended | SessionEnd::Verification => Ok(()),
        }
    }

    /// Consumes producer orders and node answers until the queue drains.
    async fn receive_loop(
        &self,
        node_id: NodeId,
        stream: &mut dyn ExitStream,
        pending: &PendingMap,
        orders_rx: &mut mpsc::Receiver<ProducerEvent>,
    ) -> Result<SessionEnd> {
        let mut pieces_transferred = 0u64;
        let mut pieces_failed = 0u64;
        let mut producer_done = false;

        loop {
            let pending_empty = pending.lock().await.is_empty();
            if pending_empty && producer_done {
                return Ok(SessionEnd::Drained {
                    transferred: pieces_transferred,
                    failed: pieces_failed,
                });
            }

            let step = if pending_empty {
                // Nothing outstanding: only the producer moves us forward.
                match orders_rx.recv().await {
                    Some(event) => Step::Producer(event),
                    None => {
                        producer_done = true;
                        continue;
                    }
                }
            } else if producer_done {
                match tokio::time::timeout(self.config.recv_timeout, stream.recv()).await {
                    Err(_) => return Err(ExitError::RecvTimeout),
                    Ok(result) => Step::Node(result?),
                }
            } else {
                tokio::select! {
                    event = orders_rx.recv() => match event {
                        Some(event) => Step::Producer(event),
                        None => {
                            producer_done = true;
                            continue;
                        }
                    },
                    incoming = tokio::time::timeout(self.config.recv_timeout, stream.recv()) => {
                        match incoming {
                            Err(_) => return Err(ExitError::RecvTimeout),
                            Ok(result) => Step::Node(result?),
                        }
                    }
                }
            };

            match step {
                Step::Producer(ProducerEvent::Order(message)) => {
                    stream.send(message).await?;
                }
                Step::Producer(ProducerEvent::Stalled) => {
                    // Rows remain but none can be served; end the session
                    // without a terminal so the node retries later.
                    return Ok(SessionEnd::Suspended);
                }
                Step::Producer(ProducerEvent::Failed(err)) => return Err(err),
                Step::Node(None) => {
                    debug!(node = %node_id, "exit stream closed mid-session");
                    return Ok(SessionEnd::Suspended);
                }
                Step::Node(Some(NodeMessage::Succeeded {
                    original_piece_id,
                    original_hash,
                    replacement_hash,
                })) => {
                    let Some(transfer) = pending.lock().await.remove(&original_piece_id) else {
                        self.fail_session(node_id, stream).await?;
                        return Ok(SessionEnd::Verification);
                    };
                    if !self
                        .verify_transfer(node_id, &transfer, &original_hash, &replacement_hash)
                        .await
                    {
                        self.fail_session(node_id, stream).await?;
                        return Ok(SessionEnd::Verification);
                    }
                    if self.commit_transfer(node_id, &transfer).await? {
                        pieces_transferred += 1;
                        self.queue.delete(&transfer.item, Utc::now());
                        stream
                            .send(SatelliteMessage::DeletePiece { original_piece_id })
                            .await?;
                    }
                    // A lost commit race leaves the row queued; a later
                    // producer pass retries with a fresh target.
                }
                Step::Node(Some(NodeMessage::Failed {
                    original_piece_id,
                    code,
                })) => {
                    let Some(transfer) = pending.lock().await.remove(&original_piece_id) else {
                        self.fail_session(node_id, stream).await?;
                        return Ok(SessionEnd::Verification);
                    };
                    let now = Utc::now();
                    match code {
                        TransferFailureCode::NotFound => {
                            debug!(node = %node_id, piece = %original_piece_id, "piece gone from exiting node");
                            remove_exiting_piece(&self.metabase, node_id, &transfer.item).await?;
                            self.queue.delete(&transfer.item, now);
                        }
                        TransferFailureCode::Unknown => {
                            let failures = self.queue.mark_failed(&transfer.item, code, now);
                            if failures >= self.config.max_failures_per_piece {
                                pieces_failed += 1;
                                self.queue.delete(&transfer.item, now);
                            }
                        }
                    }
                }
            }
        }
    }

    /// `Finishing`: terminal message, overlay status, queue purge.
    async fn finish(
        &self,
        node_id: NodeId,
        stream: &mut dyn ExitStream,
        pieces_transferred: u64,
        pieces_failed: u64,
    ) -> Result<()> {
        let total = pieces_failed + pieces_transferred;
        let failure_ratio = if total == 0 {
            0.0
        } else {
            pieces_failed as f64 / total as f64
        };
        let finished_at = Utc::now();
        if failure_ratio >= self.config.overall_max_failures_percentage && pieces_failed > 0 {
            info!(node = %node_id, failure_ratio, "graceful exit failed");
            stream
                .send(self.signed_exit_failed(
                    node_id,
                    ExitFailedReason::OverallFailurePercentageExceeded,
                    finished_at,
                ))
                .await?;
            // Disqualify before marking finished; the overlay spares
            // already-exited nodes.
            self.overlay
                .disqualify_node(node_id, DisqualificationReason::ExitFailure, finished_at)
                .await?;
            self.overlay
                .update_exit_status(ExitStatusRequest {
                    finished_at: Some(finished_at),
                    success: Some(false),
                    ..ExitStatusRequest::new(node_id)
                })
                .await?;
        } else {
            info!(node = %node_id, pieces_transferred, "graceful exit completed");
            stream
                .send(self.signed_exit_completed(node_id, finished_at))
                .await?;
            self.overlay
                .update_exit_status(ExitStatusRequest {
                    finished_at: Some(finished_at),
                    success: Some(true),
                    ..ExitStatusRequest::new(node_id)
                })
                .await?;
        }
        self.queue.delete_all(node_id);
        Ok(())
    }

    /// Signature and size checks on a claimed transfer.
    async fn verify_transfer(
        &self,
        node_id: NodeId,
        transfer: &PendingTransfer,
        original_hash: &StorageNodeHash,
        replacement_hash: &StorageNodeHash,
    ) -> bool {
        if replacement_hash.piece_id != transfer.replacement_piece_id
            || replacement_hash.hash != original_hash.hash
            || replacement_hash.piece_size != transfer.piece_size
        {
            return false;
        }
        let exiting_key = match self.overlay.get(node_id).await {
            Ok(record) => record.verifying_key,
            Err(_) => None,
        };
        let target_key = match self.overlay.get(transfer.target.id).await {
            Ok(record) => record.verifying_key,
            Err(_) => None,
        };
        let original_ok = exiting_key.is_some_and(|key| original_hash.verify(&key).is_ok());
        let replacement_ok = target_key.is_some_and(|key| replacement_hash.verify(&key).is_ok());
        original_ok && replacement_ok
    }

    /// Swaps the exiting node for the replacement in the piece set.
    ///
    /// Returns `false` when the row should stay queued for another try.
    async fn commit_transfer(&self, node_id: NodeId, transfer: &PendingTransfer) -> Result<bool> {
        let segment = match self
            .metabase
            .get_segment_by_position(transfer.item.stream_id, transfer.item.position)
            .await
        {
            Ok(segment) => segment,
            Err(MetabaseError::NotFound { .. }) => {
                self.queue.delete(&transfer.item, Utc::now());
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        };

        let new_pieces = segment.pieces.without_node(node_id).with_piece(Piece {
            number: transfer.item.piece_number,
            node: transfer.target.id,
        });
        match self
            .metabase
            .update_segment_pieces(UpdateSegmentPieces {
                stream_id: transfer.item.stream_id,
                position: transfer.item.position,
                old_pieces: segment.pieces,
                new_pieces,
                new_redundancy: None,
                new_repaired_at: None,
            })
            .await
        {
            Ok(()) => Ok(true),
            Err(MetabaseError::Changed { .. } | MetabaseError::InvalidPieces(_)) => {
                // Lost the race or the target just gained a piece of this
                // segment some other way; retry with a fresh target.
                debug!(node = %node_id, "transfer commit conflicted, requeueing");
                Ok(false)
            }
            Err(MetabaseError::NotFound { .. }) => {
                self.queue.delete(&transfer.item, Utc::now());
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Terminal `VERIFICATION_FAILED`: invalid message from the node.
    async fn fail_session(&self, node_id: NodeId, stream: &mut dyn ExitStream) -> Result<()> {
        warn!(node = %node_id, "invalid exit message, failing the session");
        let finished_at = Utc::now();
        stream
            .send(self.signed_exit_failed(
                node_id,
                ExitFailedReason::VerificationFailed,
                finished_at,
            ))
            .await?;
        self.overlay
            .update_exit_status(ExitStatusRequest {
                finished_at: Some(finished_at),
                success: Some(false),
                ..ExitStatusRequest::new(node_id)
            })
            .await?;
        self.queue.delete_all(node_id);
        Ok(())
    }

    fn signed_exit_completed(
        &self,
        node: NodeId,
        finished_at: chrono::DateTime<Utc>,
    ) -> SatelliteMessage {
        let bytes = SatelliteMessage::exit_completed_signing_bytes(node, finished_at);
        SatelliteMessage::ExitCompleted {
            node,
            finished_at,
            signature: self.orders.identity().sign(&bytes).to_vec(),
        }
    }

    fn signed_exit_failed(
        &self,
        node: NodeId,
        reason: ExitFailedReason,
        finished_at: chrono::DateTime<Utc>,
    ) -> SatelliteMessage {
        let bytes = SatelliteMessage::exit_failed_signing_bytes(node, reason, finished_at);
        SatelliteMessage::ExitFailed {
            node,
            reason,
            finished_at,
            signature: self.orders.identity().sign(&bytes).to_vec(),
        }
    }
}

/// Producer half of a session: turns queue rows into transfer orders.
///
/// Runs as its own task on a ~100 ms cycle. Whenever the pending-map is
/// empty it pulls the next batch of rows, resolves each against the
/// catalogue, and hands sendable orders to the receiver. Exiting (queue
/// drained, every row deferred, or a hard error) closes the channel,
/// which is the receiver's signal that production is over.
struct TransferProducer {
    metabase: Arc<Metabase>,
    overlay: Arc<Overlay>,
    orders: Arc<OrderService>,
    queue: Arc<TransferQueue>,
    config: ExitConfig,
    node_id: NodeId,
    pending: PendingMap,
    orders_tx: mpsc::Sender<ProducerEvent>,
}

impl TransferProducer {
    async fn run(self) {
        let mut tick = tokio::time::interval(PRODUCER_INTERVAL);
        loop {
            tick.tick().await;
            if !self.pending.lock().await.is_empty() {
                continue;
            }

            let batch = self.queue.get_incomplete(
                self.node_id,
                self.config.endpoint_batch_size,
                &HashSet::new(),
            );
            if batch.is_empty() {
                return;
            }

            let mut progressed = false;
            for item in batch {
                match self.produce_transfer(&item).await {
                    Ok(Produced::Sent(transfer)) => {
                        let message = match self.transfer_message(&transfer).await {
                            Ok(message) => message,
                            Err(err) => {
                                let _ = self.orders_tx.send(ProducerEvent::Failed(err)).await;
                                return;
                            }
                        };
                        self.queue.increment_order_limit_send(&transfer.item);
                        let original_piece_id = transfer
                            .item
                            .root_piece_id
                            .derive(self.node_id, transfer.item.piece_number);
                        self.pending
                            .lock()
                            .await
                            .insert(original_piece_id, *transfer);
                        if self
                            .orders_tx
                            .send(ProducerEvent::Order(message))
                            .await
                            .is_err()
                        {
                            return;
                        }
                        progressed = true;
                    }
                    Ok(Produced::Settled) => progressed = true,
                    Ok(Produced::Deferred) => {}
                    Err(err) => {
                        let _ = self.orders_tx.send(ProducerEvent::Failed(err)).await;
                        return;
                    }
                }
            }
            if !progressed {
                let _ = self.orders_tx.send(ProducerEvent::Stalled).await;
                return;
            }
        }
    }

    /// Turns one queue row into a transfer order, or settles it.
    async fn produce_transfer(&self, item: &TransferItem) -> Result<Produced> {
        let now = Utc::now();
        let segment = match self
            .metabase
            .get_segment_by_position(item.stream_id, item.position)
            .await
        {
            Ok(segment) => segment,
            Err(MetabaseError::NotFound { .. }) => {
                self.queue.delete(item, now);
                return Ok(Produced::Settled);
            }
            Err(err) => return Err(err.into()),
        };
        let still_held = segment
            .pieces
            .by_number(item.piece_number)
            .is_some_and(|piece| piece.node == self.node_id);
        if !still_held {
            self.queue.delete(item, now);
            return Ok(Produced::Settled);
        }

        // Redundant piece: the segment stays above optimal without it.
        if segment.pieces.len() > usize::from(segment.redundancy.optimal) {
            remove_exiting_piece(&self.metabase, self.node_id, item).await?;
            self.queue.delete(item, now);
            return Ok(Produced::Settled);
        }

        let target = match self
            .overlay
            .find_storage_nodes_for_graceful_exit(
                &NodeSelectionRequest {
                    requested_count: 1,
                    excluded: segment.pieces.node_ids(),
                },
                now,
            )
            .await
        {
            Ok(mut nodes) => nodes.remove(0),
            Err(OverlayError::NotEnoughNodes { .. }) => {
                warn!(node = %self.node_id, "no replacement target available, deferring transfer");
                return Ok(Produced::Deferred);
            }
            Err(err) => return Err(err.into()),
        };

        let piece_size = segment.piece_size();
        Ok(Produced::Sent(Box::new(PendingTransfer {
            replacement_piece_id: segment
                .root_piece_id
                .derive(target.id, item.piece_number),
            item: item.clone(),
            target,
            piece_size,
        })))
    }

    async fn transfer_message(&self, transfer: &PendingTransfer) -> Result<SatelliteMessage> {
        let now = Utc::now();
        let (limited, piece_key) = self
            .orders
            .create_put_limit(
                transfer.item.root_piece_id,
                transfer.item.piece_number,
                transfer.target.clone(),
                transfer.piece_size,
                now,
            )
            .await?;
        Ok(SatelliteMessage::TransferPiece(TransferPiece {
            original_piece_id: transfer
                .item
                .root_piece_id
                .derive(self.node_id, transfer.item.piece_number),
            addressed_limit: limited.limit,
            target_address: transfer.target.address.clone(),
            piece_private_key: piece_key.to_bytes().to_vec(),
        }))
    }
}

/// Removes the exiting node's piece where no transfer is needed.
async fn remove_exiting_piece(
    metabase: &Metabase,
    node_id: NodeId,
    item: &TransferItem,
) -> Result<()> {
    let segment = match metabase
        .get_segment_by_position(item.stream_id, item.position)
        .await
    {
        Ok(segment) => segment,
        Err(MetabaseError::NotFound { .. }) => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    let new_pieces = segment.pieces.without_node(node_id);
    match metabase
        .update_segment_pieces(UpdateSegmentPieces {
            stream_id: item.stream_id,
            position: item.position,
            old_pieces: segment.pieces,
            new_pieces,
            new_redundancy: None,
            new_repaired_at: None,
        })
        .await
    {
        Ok(()) | Err(MetabaseError::Changed { .. } | MetabaseError::NotFound { .. }) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Process-wide one-session-per-node lock.
struct SessionGuard<'a> {
    active: &'a Mutex<HashSet<NodeId>>,
    node: NodeId,
}

impl<'a> SessionGuard<'a> {
    fn acquire(active: &'a Mutex<HashSet<NodeId>>, node: NodeId) -> Result<Self> {
        let mut set = active.lock().expect("session set lock poisoned");
        if !set.insert(node) {
            return Err(ExitError::SessionActive(node));
        }
        Ok(Self { active, node })
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .expect("session set lock poisoned")
            .remove(&self.node);
    }
}
