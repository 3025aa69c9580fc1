//! The graceful-exit transfer queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use meridian_piecestore::TransferFailureCode;
use meridian_types::{NodeId, PieceId, SegmentPosition, StreamId};

/// One piece the exiting node still has to hand over.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferItem {
    pub node_id: NodeId,
    pub stream_id: StreamId,
    pub position: SegmentPosition,
    pub piece_number: u16,
    pub root_piece_id: PieceId,
    /// `pieces / total` at collection time.
    pub durability_ratio: f64,
    pub queued_at: DateTime<Utc>,
    pub order_limit_send_count: u32,
    pub failed_count: u32,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub last_failed_code: Option<TransferFailureCode>,
}

type Key = (StreamId, u64, u16);

fn key_of(item: &TransferItem) -> Key {
    (item.stream_id, item.position.encode(), item.piece_number)
}

#[derive(Debug, Default)]
struct NodeQueue {
    order: VecDeque<Key>,
    items: HashMap<Key, TransferItem>,
    last_activity: Option<DateTime<Utc>>,
}

/// Durable set of transfer rows, one per (exiting node, piece).
///
/// Rows persist across failed attempts; they disappear only on verified
/// success or terminal failure. The per-node activity timestamp feeds
/// the chore's inactivity check.
#[derive(Debug, Default)]
pub struct TransferQueue {
    nodes: Mutex<HashMap<NodeId, NodeQueue>>,
}

impl TransferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a row. Idempotent per (node, segment, piece).
    pub fn enqueue(&self, item: TransferItem) -> bool {
        let key = key_of(&item);
        let mut nodes = self.nodes.lock().expect("transfer queue lock poisoned");
        let queue = nodes.entry(item.node_id).or_default();
        queue.last_activity = Some(item.queued_at);
        match queue.items.entry(key) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(item);
                queue.order.push_back(key);
                true
            }
        }
    }

    /// Up to `limit` incomplete rows, oldest first, excluding `skip`.
    pub fn get_incomplete(
        &self,
        node: NodeId,
        limit: usize,
        skip: &HashSet<(StreamId, u64, u16)>,
    ) -> Vec<TransferItem> {
        let nodes = self.nodes.lock().expect("transfer queue lock poisoned");
        let Some(queue) = nodes.get(&node) else {
            return Vec::new();
        };
        queue
            .order
            .iter()
            .filter(|key| !skip.contains(key))
            .filter_map(|key| queue.items.get(key))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Bumps the order-limit send counter for a row.
    pub fn increment_order_limit_send(&self, item: &TransferItem) {
        let mut nodes = self.nodes.lock().expect("transfer queue lock poisoned");
        if let Some(queue) = nodes.get_mut(&item.node_id) {
            if let Some(row) = queue.items.get_mut(&key_of(item)) {
                row.order_limit_send_count += 1;
            }
        }
    }

    /// Records a failed transfer attempt; returns the new failure count.
    pub fn mark_failed(
        &self,
        item: &TransferItem,
        code: TransferFailureCode,
        now: DateTime<Utc>,
    ) -> u32 {
        let mut nodes = self.nodes.lock().expect("transfer queue lock poisoned");
        let Some(queue) = nodes.get_mut(&item.node_id) else {
            return 0;
        };
        queue.last_activity = Some(now);
        match queue.items.get_mut(&key_of(item)) {
            Some(row) => {
                row.failed_count += 1;
                row.last_failed_at = Some(now);
                row.last_failed_code = Some(code);
                row.failed_count
            }
            None => 0,
        }
    }

    /// Removes one row (verified success or terminal failure).
    pub fn delete(&self, item: &TransferItem, now: DateTime<Utc>) -> bool {
        let mut nodes = self.nodes.lock().expect("transfer queue lock poisoned");
        let Some(queue) = nodes.get_mut(&item.node_id) else {
            return false;
        };
        queue.last_activity = Some(now);
        let key = key_of(item);
        queue.order.retain(|existing| *existing != key);
        queue.items.remove(&key).is_some()
    }

    /// Purges every row of a node.
    pub fn delete_all(&self, node: NodeId) -> usize {
        let mut nodes = self.nodes.lock().expect("transfer queue lock poisoned");
        nodes.remove(&node).map_or(0, |queue| queue.items.len())
    }

    pub fn count(&self, node: NodeId) -> usize {
        self.nodes
            .lock()
            .expect("transfer queue lock poisoned")
            .get(&node)
            .map_or(0, |queue| queue.items.len())
    }

    /// All rows of a node, for inspection.
    pub fn items(&self, node: NodeId) -> Vec<TransferItem> {
        let nodes = self.nodes.lock().expect("transfer queue lock poisoned");
        nodes.get(&node).map_or_else(Vec::new, |queue| {
            queue
                .order
                .iter()
                .filter_map(|key| queue.items.get(key))
                .cloned()
                .collect()
        })
    }

    /// When the node's queue last saw progress.
    pub fn last_activity(&self, node: NodeId) -> Option<DateTime<Utc>> {
        self.nodes
            .lock()
            .expect("transfer queue lock poisoned")
            .get(&node)
            .and_then(|queue| queue.last_activity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(node: NodeId, piece_number: u16) -> TransferItem {
        TransferItem {
            node_id: node,
            stream_id: StreamId::default(),
            position: SegmentPosition::new(0, 0),
            piece_number,
            root_piece_id: PieceId::from_bytes([1u8; 32]),
            durability_ratio: 0.75,
            queued_at: Utc::now(),
            order_limit_send_count: 0,
            failed_count: 0,
            last_failed_at: None,
            last_failed_code: None,
        }
    }

    #[test]
    fn enqueue_is_idempotent_per_piece() {
        let queue = TransferQueue::new();
        let node = NodeId::generate();

        assert!(queue.enqueue(item(node, 0)));
        assert!(!queue.enqueue(item(node, 0)));
        assert!(queue.enqueue(item(node, 1)));
        assert_eq!(queue.count(node), 2);
    }

    #[test]
    fn get_incomplete_respects_limit_and_skip() {
        let queue = TransferQueue::new();
        let node = NodeId::generate();
        for number in 0..5 {
            queue.enqueue(item(node, number));
        }

        let batch = queue.get_incomplete(node, 3, &HashSet::new());
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].piece_number, 0);

        let skip: HashSet<_> = batch
            .iter()
            .map(|item| (item.stream_id, item.position.encode(), item.piece_number))
            .collect();
        let rest = queue.get_incomplete(node, 10, &skip);
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].piece_number, 3);
    }

    #[test]
    fn mark_failed_accumulates_and_delete_removes() {
        let queue = TransferQueue::new();
        let node = NodeId::generate();
        let row = item(node, 0);
        queue.enqueue(row.clone());

        assert_eq!(
            queue.mark_failed(&row, TransferFailureCode::Unknown, Utc::now()),
            1
        );
        assert_eq!(
            queue.mark_failed(&row, TransferFailureCode::Unknown, Utc::now()),
            2
        );
        let stored = &queue.items(node)[0];
        assert_eq!(stored.failed_count, 2);
        assert_eq!(stored.last_failed_code, Some(TransferFailureCode::Unknown));

        assert!(queue.delete(&row, Utc::now()));
        assert_eq!(queue.count(node), 0);
    }

    #[test]
    fn delete_all_purges_and_reports_remainder() {
        let queue = TransferQueue::new();
        let node = NodeId::generate();
        for number in 0..4 {
            queue.enqueue(item(node, number));
        }
        assert_eq!(queue.delete_all(node), 4);
        assert_eq!(queue.count(node), 0);
        assert!(queue.last_activity(node).is_none());
    }

    #[test]
    fn activity_tracks_enqueue_and_failures() {
        let queue = TransferQueue::new();
        let node = NodeId::generate();
        assert!(queue.last_activity(node).is_none());

        let row = item(node, 0);
        queue.enqueue(row.clone());
        let after_enqueue = queue.last_activity(node).unwrap();

        let later = Utc::now() + chrono::Duration::seconds(10);
        queue.mark_failed(&row, TransferFailureCode::NotFound, later);
        assert!(queue.last_activity(node).unwrap() > after_enqueue);
    }
}
