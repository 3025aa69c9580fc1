//! FIFO audit queue with atomic swap-in.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::reservoir::AuditItem;

/// Work queue between the collection chore and the audit workers.
///
/// The chore pushes whole batches. While the current queue still has
/// items the batch parks as `pending`; the moment the current queue
/// drains, the next `pop` swaps the pending batch in. Workers therefore
/// always finish one collection pass before starting the next.
#[derive(Debug, Default)]
pub struct AuditQueue {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    current: VecDeque<AuditItem>,
    pending: Option<Vec<AuditItem>>,
}

impl AuditQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a freshly collected batch.
    ///
    /// Replaces any still-parked batch: reservoirs sampled later are a
    /// strictly fresher view of the same segments.
    pub fn push_batch(&self, items: Vec<AuditItem>) {
        let mut inner = self.inner.lock().expect("audit queue lock poisoned");
        if inner.current.is_empty() {
            inner.current = items.into();
        } else {
            inner.pending = Some(items);
        }
    }

    /// Pops the next audit, swapping in the parked batch when drained.
    pub fn pop(&self) -> Option<AuditItem> {
        let mut inner = self.inner.lock().expect("audit queue lock poisoned");
        if inner.current.is_empty() {
            if let Some(pending) = inner.pending.take() {
                inner.current = pending.into();
            }
        }
        inner.current.pop_front()
    }

    /// Items remaining in the active queue.
    pub fn size(&self) -> usize {
        self.inner.lock().expect("audit queue lock poisoned").current.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_types::{SegmentPosition, StreamId};

    fn item(index: u32) -> AuditItem {
        AuditItem {
            stream_id: StreamId::default(),
            position: SegmentPosition::new(0, index),
            stripe_index: 0,
        }
    }

    #[test]
    fn pops_in_fifo_order() {
        let queue = AuditQueue::new();
        queue.push_batch(vec![item(1), item(2), item(3)]);

        assert_eq!(queue.size(), 3);
        assert_eq!(queue.pop(), Some(item(1)));
        assert_eq!(queue.pop(), Some(item(2)));
        assert_eq!(queue.pop(), Some(item(3)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn second_batch_waits_until_first_drains() {
        let queue = AuditQueue::new();
        queue.push_batch(vec![item(1), item(2)]);
        queue.push_batch(vec![item(10)]);

        // Still serving the first batch.
        assert_eq!(queue.pop(), Some(item(1)));
        assert_eq!(queue.pop(), Some(item(2)));
        // Drained: the parked batch swaps in.
        assert_eq!(queue.pop(), Some(item(10)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn newer_pending_batch_replaces_older() {
        let queue = AuditQueue::new();
        queue.push_batch(vec![item(1)]);
        queue.push_batch(vec![item(2)]);
        queue.push_batch(vec![item(3)]);

        assert_eq!(queue.pop(), Some(item(1)));
        assert_eq!(queue.pop(), Some(item(3)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn batch_into_empty_queue_is_immediately_active() {
        let queue = AuditQueue::new();
        queue.push_batch(vec![item(5)]);
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.pop(), Some(item(5)));
    }
}
