//! The injured-segment queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use meridian_types::{SegmentPosition, StreamId};

/// A segment at or below its repair threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjuredSegment {
    pub stream_id: StreamId,
    pub position: SegmentPosition,
    /// Healthy-piece count at enqueue time.
    pub health: u16,
    pub inserted_at: DateTime<Utc>,
}

/// Durable set of injured segments, insertion-ordered.
///
/// Re-enqueuing a key already present is idempotent: the health value is
/// refreshed but the segment keeps its place in line.
#[derive(Debug, Default)]
pub struct RepairQueue {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    order: VecDeque<(StreamId, u64)>,
    segments: HashMap<(StreamId, u64), InjuredSegment>,
}

impl RepairQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues an injured segment. Returns whether it was newly added.
    pub fn insert(&self, segment: InjuredSegment) -> bool {
        let key = (segment.stream_id, segment.position.encode());
        let mut inner = self.inner.lock().expect("repair queue lock poisoned");
        match inner.segments.insert(key, segment) {
            Some(_) => false,
            None => {
                inner.order.push_back(key);
                true
            }
        }
    }

    /// Pops the oldest injured segment.
    pub fn pop(&self) -> Option<InjuredSegment> {
        let mut inner = self.inner.lock().expect("repair queue lock poisoned");
        while let Some(key) = inner.order.pop_front() {
            if let Some(segment) = inner.segments.remove(&key) {
                return Some(segment);
            }
        }
        None
    }

    /// Removes a segment without repairing it.
    pub fn delete(&self, stream_id: StreamId, position: SegmentPosition) -> bool {
        let key = (stream_id, position.encode());
        let mut inner = self.inner.lock().expect("repair queue lock poisoned");
        // Stale order entries are skipped by `pop`.
        inner.segments.remove(&key).is_some()
    }

    pub fn count(&self) -> usize {
        self.inner
            .lock()
            .expect("repair queue lock poisoned")
            .segments
            .len()
    }

    pub fn contains(&self, stream_id: StreamId, position: SegmentPosition) -> bool {
        self.inner
            .lock()
            .expect("repair queue lock poisoned")
            .segments
            .contains_key(&(stream_id, position.encode()))
    }
}
