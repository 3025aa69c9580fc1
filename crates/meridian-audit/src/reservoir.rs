//! Per-node audit reservoirs.

use meridian_types::{SegmentPosition, StreamId};
use rand::Rng;

/// One queued audit: challenge the holders of this segment for their
/// shares of stripe `stripe_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AuditItem {
    pub stream_id: StreamId,
    pub position: SegmentPosition,
    pub stripe_index: u32,
}

/// Bounded random sample of audit candidates for one node.
///
/// Every offered candidate draws a uniform priority; the reservoir keeps
/// the highest-priority candidates seen this pass. Offering the same
/// (segment, stripe) twice is a no-op, so a reservoir never holds
/// duplicates.
#[derive(Debug, Clone)]
pub struct Reservoir {
    capacity: usize,
    entries: Vec<(f64, AuditItem)>,
}

impl Reservoir {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Vec::with_capacity(capacity.max(1)),
        }
    }

    /// Offers a candidate with a freshly drawn priority.
    pub fn offer<R: Rng>(&mut self, item: AuditItem, rng: &mut R) {
        if self.entries.iter().any(|(_, existing)| *existing == item) {
            return;
        }
        let priority: f64 = rng.r#gen();
        if self.entries.len() < self.capacity {
            self.entries.push((priority, item));
            return;
        }
        let (min_index, min_priority) = self
            .entries
            .iter()
            .enumerate()
            .map(|(index, (p, _))| (index, *p))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .expect("reservoir at capacity is non-empty");
        if priority > min_priority {
            self.entries[min_index] = (priority, item);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drains the sampled items, dropping priorities.
    pub fn take(self) -> Vec<AuditItem> {
        self.entries.into_iter().map(|(_, item)| item).collect()
    }

    pub fn items(&self) -> impl Iterator<Item = &AuditItem> {
        self.entries.iter().map(|(_, item)| item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;

    fn item(index: u32) -> AuditItem {
        AuditItem {
            stream_id: StreamId::generate(),
            position: SegmentPosition::new(0, index),
            stripe_index: 0,
        }
    }

    #[test]
    fn respects_capacity() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut reservoir = Reservoir::new(3);
        for i in 0..100 {
            reservoir.offer(item(i), &mut rng);
        }
        assert_eq!(reservoir.len(), 3);
    }

    #[test]
    fn never_holds_duplicates() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut reservoir = Reservoir::new(4);
        let candidate = item(1);
        for _ in 0..50 {
            reservoir.offer(candidate, &mut rng);
        }
        assert_eq!(reservoir.len(), 1);

        // Same segment, different stripe, is a distinct candidate.
        let mut other = candidate;
        other.stripe_index = 1;
        reservoir.offer(other, &mut rng);
        assert_eq!(reservoir.len(), 2);
    }

    #[test]
    fn keeps_a_uniform_ish_sample() {
        // With capacity 1 and many offers, every candidate should win
        // sometimes: run many trials and check the winner varies.
        let candidates: Vec<AuditItem> = (0..10).map(item).collect();
        let mut winners = HashSet::new();
        for seed in 0..200 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut reservoir = Reservoir::new(1);
            for candidate in &candidates {
                reservoir.offer(*candidate, &mut rng);
            }
            winners.insert(reservoir.take()[0]);
        }
        assert!(winners.len() >= 5, "sample collapsed to {}", winners.len());
    }
}
