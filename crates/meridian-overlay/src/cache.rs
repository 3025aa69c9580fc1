//! Read-mostly snapshot of the reliable node set.

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use meridian_types::NodeId;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::service::Overlay;

/// Immutable view of node reliability at one instant.
#[derive(Debug)]
pub struct ReliabilitySnapshot {
    reliable: HashSet<NodeId>,
    /// Reliable nodes placed in excluded countries; they hold pieces but
    /// never count as healthy for placement.
    excluded_country: HashSet<NodeId>,
    created_at: DateTime<Utc>,
}

impl ReliabilitySnapshot {
    pub fn is_reliable(&self, id: NodeId) -> bool {
        self.reliable.contains(&id)
    }

    pub fn in_excluded_country(&self, id: NodeId) -> bool {
        self.excluded_country.contains(&id)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn reliable_count(&self) -> usize {
        self.reliable.len()
    }
}

/// Cached reliable-node membership with lock-free reads.
///
/// Readers load the current snapshot through an atomic pointer. A reader
/// that needs data at least as fresh as some instant, or that finds the
/// snapshot older than the staleness bound, takes the refresh mutex,
/// re-checks, and rebuilds from the overlay. Refresh failures surface to
/// the caller; a stale snapshot is never silently served past staleness.
pub struct ReliabilityCache {
    overlay: Arc<Overlay>,
    staleness: chrono::Duration,
    state: ArcSwap<ReliabilitySnapshot>,
    refresh: Mutex<()>,
}

impl ReliabilityCache {
    pub fn new(overlay: Arc<Overlay>) -> Self {
        let staleness = chrono::Duration::from_std(overlay.config().cache_staleness)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        Self {
            overlay,
            staleness,
            // Born stale: the first read refreshes.
            state: ArcSwap::from_pointee(ReliabilitySnapshot {
                reliable: HashSet::new(),
                excluded_country: HashSet::new(),
                created_at: DateTime::<Utc>::MIN_UTC,
            }),
            refresh: Mutex::new(()),
        }
    }

    /// Returns a snapshot no older than the staleness bound and no older
    /// than `valid_up_to`.
    pub async fn snapshot(&self, valid_up_to: Option<DateTime<Utc>>) -> Result<Arc<ReliabilitySnapshot>> {
        let now = Utc::now();
        let current = self.state.load_full();
        if self.is_fresh(&current, valid_up_to, now) {
            return Ok(current);
        }

        let _guard = self.refresh.lock().await;
        // Double-check: another caller may have refreshed while we waited.
        let current = self.state.load_full();
        if self.is_fresh(&current, valid_up_to, now) {
            return Ok(current);
        }

        let (reliable, excluded_country) = self.overlay.reliability_sets(now).await?;
        debug!(reliable = reliable.len(), "refreshed reliability snapshot");
        let fresh = Arc::new(ReliabilitySnapshot {
            reliable,
            excluded_country,
            created_at: now,
        });
        self.state.store(fresh.clone());
        Ok(fresh)
    }

    /// Forces the next read to rebuild.
    pub fn invalidate(&self) {
        let current = self.state.load_full();
        self.state.store(Arc::new(ReliabilitySnapshot {
            reliable: current.reliable.clone(),
            excluded_country: current.excluded_country.clone(),
            created_at: DateTime::<Utc>::MIN_UTC,
        }));
    }

    fn is_fresh(
        &self,
        snapshot: &ReliabilitySnapshot,
        valid_up_to: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        if let Some(valid_up_to) = valid_up_to {
            if snapshot.created_at < valid_up_to {
                return false;
            }
        }
        now.signed_duration_since(snapshot.created_at) <= self.staleness
    }
}
