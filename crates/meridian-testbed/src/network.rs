//! Fake storage nodes and the in-process network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use meridian_gc::BloomFilter;
use meridian_metabase::Metabase;
use meridian_orders::{
    Action, PiecePrivateKey, SignedOrderLimit, StorageNodeHash, piece_hash,
};
use meridian_overlay::SelectedNode;
use meridian_piecestore::{NodeClient, PieceStoreError, RetainRequest};
use meridian_types::{NodeId, PieceId, SegmentPosition, StreamId};
use rand::rngs::OsRng;

/// One stored piece with its upload-time hash receipt.
#[derive(Debug, Clone)]
struct StoredPiece {
    data: Vec<u8>,
    hash: StorageNodeHash,
    stored_at: DateTime<Utc>,
}

/// A scriptable fake storage node.
pub struct TestNode {
    id: NodeId,
    signing: SigningKey,
    pieces: Mutex<HashMap<PieceId, StoredPiece>>,
    stopped: AtomicBool,
    contained: AtomicBool,
    retains: Mutex<Vec<RetainRequest>>,
}

impl TestNode {
    pub fn new() -> Arc<Self> {
        let signing = SigningKey::generate(&mut OsRng);
        Arc::new(Self {
            id: NodeId::from_bytes(signing.verifying_key().to_bytes()),
            signing,
            pieces: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            contained: AtomicBool::new(false),
            retains: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Stores a piece and returns the signed hash receipt.
    pub fn store_piece(&self, piece_id: PieceId, data: Vec<u8>, now: DateTime<Utc>) -> StorageNodeHash {
        let mut hash = StorageNodeHash {
            piece_id,
            hash: piece_hash(&data),
            piece_size: data.len() as u64,
            timestamp: now,
            signature: Vec::new(),
        };
        hash.signature = self.signing.sign(&hash.signing_bytes()).to_vec();
        self.pieces.lock().unwrap().insert(
            piece_id,
            StoredPiece {
                data,
                hash: hash.clone(),
                stored_at: now,
            },
        );
        hash
    }

    /// Flips the last byte of a stored piece, keeping the old receipt.
    pub fn corrupt_piece(&self, piece_id: PieceId) {
        let mut pieces = self.pieces.lock().unwrap();
        if let Some(piece) = pieces.get_mut(&piece_id) {
            if let Some(last) = piece.data.last_mut() {
                *last ^= 0xFF;
            }
        }
    }

    pub fn remove_piece(&self, piece_id: PieceId) -> bool {
        self.pieces.lock().unwrap().remove(&piece_id).is_some()
    }

    pub fn has_piece(&self, piece_id: PieceId) -> bool {
        self.pieces.lock().unwrap().contains_key(&piece_id)
    }

    pub fn piece_data(&self, piece_id: PieceId) -> Option<Vec<u8>> {
        self.pieces
            .lock()
            .unwrap()
            .get(&piece_id)
            .map(|piece| piece.data.clone())
    }

    pub fn hash_record(&self, piece_id: PieceId) -> Option<StorageNodeHash> {
        self.pieces
            .lock()
            .unwrap()
            .get(&piece_id)
            .map(|piece| piece.hash.clone())
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.lock().unwrap().len()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn start(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// While contained the node answers share requests with "retry later".
    pub fn set_contained(&self, contained: bool) {
        self.contained.store(contained, Ordering::SeqCst);
    }

    pub fn retain_requests(&self) -> Vec<RetainRequest> {
        self.retains.lock().unwrap().clone()
    }

    /// Deletes everything older than the request that is not in the
    /// filter, the way a real node executes a retain.
    pub fn apply_retain(&self, request: &RetainRequest) -> usize {
        let Some(filter) = BloomFilter::decode(&request.filter) else {
            return 0;
        };
        let mut pieces = self.pieces.lock().unwrap();
        let before = pieces.len();
        pieces.retain(|piece_id, piece| {
            piece.stored_at >= request.creation_date || filter.contains(piece_id)
        });
        before - pieces.len()
    }
}

/// In-process transport connecting the core to its fake nodes.
pub struct TestNetwork {
    satellite_key: VerifyingKey,
    nodes: Mutex<HashMap<NodeId, Arc<TestNode>>>,
}

impl TestNetwork {
    pub fn new(satellite_key: VerifyingKey) -> Arc<Self> {
        Arc::new(Self {
            satellite_key,
            nodes: Mutex::new(HashMap::new()),
        })
    }

    pub fn add_node(&self, node: Arc<TestNode>) {
        self.nodes.lock().unwrap().insert(node.id(), node);
    }

    pub fn node(&self, id: NodeId) -> Option<Arc<TestNode>> {
        self.nodes.lock().unwrap().get(&id).cloned()
    }

    fn dial(&self, target: &SelectedNode) -> Result<Arc<TestNode>, PieceStoreError> {
        let node = self
            .node(target.id)
            .ok_or_else(|| PieceStoreError::Dial(format!("unknown node {}", target.id)))?;
        if node.is_stopped() {
            return Err(PieceStoreError::Dial(format!("{} is down", target.address)));
        }
        Ok(node)
    }

    fn check_limit(
        &self,
        limit: &SignedOrderLimit,
        node: &TestNode,
        allowed: &[Action],
    ) -> Result<(), PieceStoreError> {
        limit
            .verify(&self.satellite_key, Utc::now())
            .map_err(|err| PieceStoreError::Unauthorized(err.to_string()))?;
        if limit.limit.node != node.id() {
            return Err(PieceStoreError::Unauthorized("limit for other node".into()));
        }
        if !allowed.contains(&limit.limit.action) {
            return Err(PieceStoreError::Unauthorized("wrong action".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl NodeClient for TestNetwork {
    async fn upload_piece(
        &self,
        target: &SelectedNode,
        limit: &SignedOrderLimit,
        _piece_key: &PiecePrivateKey,
        data: &[u8],
    ) -> Result<StorageNodeHash, PieceStoreError> {
        let node = self.dial(target)?;
        self.check_limit(limit, &node, &[Action::Put, Action::PutRepair])?;
        if (data.len() as u64) > limit.limit.limit {
            return Err(PieceStoreError::Unauthorized("over limit".into()));
        }
        Ok(node.store_piece(limit.limit.piece_id, data.to_vec(), Utc::now()))
    }

    async fn download_piece(
        &self,
        target: &SelectedNode,
        limit: &SignedOrderLimit,
        _piece_key: &PiecePrivateKey,
    ) -> Result<(Vec<u8>, StorageNodeHash), PieceStoreError> {
        let node = self.dial(target)?;
        self.check_limit(limit, &node, &[Action::Get, Action::GetRepair])?;
        let pieces = node.pieces.lock().unwrap();
        let piece = pieces
            .get(&limit.limit.piece_id)
            .ok_or(PieceStoreError::NotFound)?;
        Ok((piece.data.clone(), piece.hash.clone()))
    }

    async fn download_share(
        &self,
        target: &SelectedNode,
        limit: &SignedOrderLimit,
        _piece_key: &PiecePrivateKey,
        stripe_index: u32,
        share_size: u32,
    ) -> Result<Vec<u8>, PieceStoreError> {
        let node = self.dial(target)?;
        if node.contained.load(Ordering::SeqCst) {
            return Err(PieceStoreError::Contained);
        }
        self.check_limit(limit, &node, &[Action::GetAudit])?;
        let pieces = node.pieces.lock().unwrap();
        let piece = pieces
            .get(&limit.limit.piece_id)
            .ok_or(PieceStoreError::NotFound)?;
        let start = stripe_index as usize * share_size as usize;
        let end = start + share_size as usize;
        if end > piece.data.len() {
            return Err(PieceStoreError::Transport("stripe out of range".into()));
        }
        Ok(piece.data[start..end].to_vec())
    }

    async fn retain(
        &self,
        target: &SelectedNode,
        request: &RetainRequest,
    ) -> Result<(), PieceStoreError> {
        let node = self.dial(target)?;
        node.retains.lock().unwrap().push(request.clone());
        Ok(())
    }
}

/// Client wrapper that deletes a segment on the first piece download.
///
/// Reproduces "segment deleted between download and commit" inside a
/// repair without reaching into the repairer.
pub struct SabotageClient {
    inner: Arc<TestNetwork>,
    metabase: Arc<Metabase>,
    target: Mutex<Option<(StreamId, SegmentPosition)>>,
}

impl SabotageClient {
    pub fn new(inner: Arc<TestNetwork>, metabase: Arc<Metabase>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            metabase,
            target: Mutex::new(None),
        })
    }

    /// Arms the trap: the next piece download deletes this segment.
    pub fn arm(&self, stream_id: StreamId, position: SegmentPosition) {
        *self.target.lock().unwrap() = Some((stream_id, position));
    }
}

#[async_trait]
impl NodeClient for SabotageClient {
    async fn upload_piece(
        &self,
        target: &SelectedNode,
        limit: &SignedOrderLimit,
        piece_key: &PiecePrivateKey,
        data: &[u8],
    ) -> Result<StorageNodeHash, PieceStoreError> {
        self.inner.upload_piece(target, limit, piece_key, data).await
    }

    async fn download_piece(
        &self,
        target: &SelectedNode,
        limit: &SignedOrderLimit,
        piece_key: &PiecePrivateKey,
    ) -> Result<(Vec<u8>, StorageNodeHash), PieceStoreError> {
        let armed = self.target.lock().unwrap().take();
        if let Some((stream_id, position)) = armed {
            self.metabase.delete_segment(stream_id, position).await;
        }
        self.inner.download_piece(target, limit, piece_key).await
    }

    async fn download_share(
        &self,
        target: &SelectedNode,
        limit: &SignedOrderLimit,
        piece_key: &PiecePrivateKey,
        stripe_index: u32,
        share_size: u32,
    ) -> Result<Vec<u8>, PieceStoreError> {
        self.inner
            .download_share(target, limit, piece_key, stripe_index, share_size)
            .await
    }

    async fn retain(
        &self,
        target: &SelectedNode,
        request: &RetainRequest,
    ) -> Result<(), PieceStoreError> {
        self.inner.retain(target, request).await
    }
}
