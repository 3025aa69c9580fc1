//! The node directory service.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use meridian_types::NodeId;
use rand::seq::SliceRandom;
use tracing::info;

use crate::config::OverlayConfig;
use crate::error::{OverlayError, Result};
use crate::node::{
    CheckInInfo, DisqualificationReason, ExitStatusRequest, NodeRecord, SelectedNode,
};

/// Request for replacement or upload nodes.
#[derive(Debug, Clone, Default)]
pub struct NodeSelectionRequest {
    pub requested_count: usize,
    /// Nodes (and, with subnet-distinct selection, their subnets) that must
    /// not be chosen.
    pub excluded: Vec<NodeId>,
}

/// Authoritative directory of storage nodes.
///
/// All state transitions of a node's lifecycle funnel through here:
/// check-ins, vetting, suspension, disqualification, and graceful-exit
/// bookkeeping. Disqualification and a finished exit are absorbing.
pub struct Overlay {
    config: OverlayConfig,
    nodes: Mutex<HashMap<NodeId, NodeRecord>>,
}

impl Overlay {
    pub fn new(config: OverlayConfig) -> Self {
        Self {
            config,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    /// Upserts a node from a check-in.
    ///
    /// First contact creates the record; later contacts refresh address,
    /// country, identity key and the last-contact-success timestamp.
    pub async fn update_check_in(&self, info: CheckInInfo, now: DateTime<Utc>) -> Result<()> {
        let last_net = subnet_of(&info.address)?;
        let mut nodes = self.nodes.lock().expect("overlay lock poisoned");
        match nodes.get_mut(&info.id) {
            Some(record) => {
                record.address = info.address;
                record.last_net = last_net;
                record.country = info.country.or(record.country.take());
                if info.verifying_key.is_some() {
                    record.verifying_key = info.verifying_key;
                }
                record.last_contact_success = now;
            }
            None => {
                info!(node = %info.id, "new node checked in");
                nodes.insert(
                    info.id,
                    NodeRecord {
                        id: info.id,
                        address: info.address,
                        last_net,
                        country: info.country,
                        verifying_key: info.verifying_key,
                        created_at: now,
                        vetted_at: None,
                        disqualified_at: None,
                        disqualification_reason: None,
                        unknown_audit_suspended_at: None,
                        offline_suspended_at: None,
                        exit: Default::default(),
                        piece_count: 0,
                        last_contact_success: now,
                        last_contact_failure: None,
                    },
                );
            }
        }
        Ok(())
    }

    /// Records a contact attempt outcome without touching anything else.
    pub async fn record_contact(&self, id: NodeId, success: bool, now: DateTime<Utc>) -> Result<()> {
        let mut nodes = self.nodes.lock().expect("overlay lock poisoned");
        let record = nodes.get_mut(&id).ok_or(OverlayError::NodeNotFound(id))?;
        if success {
            record.last_contact_success = now;
        } else {
            record.last_contact_failure = Some(now);
        }
        Ok(())
    }

    pub async fn get(&self, id: NodeId) -> Result<NodeRecord> {
        self.nodes
            .lock()
            .expect("overlay lock poisoned")
            .get(&id)
            .cloned()
            .ok_or(OverlayError::NodeNotFound(id))
    }

    /// Filters `ids` down to the currently reliable ones.
    pub async fn known_reliable(&self, ids: &[NodeId], now: DateTime<Utc>) -> Vec<SelectedNode> {
        let window = self.online_window();
        let nodes = self.nodes.lock().expect("overlay lock poisoned");
        ids.iter()
            .filter_map(|id| nodes.get(id))
            .filter(|record| record.is_reliable(now, window))
            .map(|record| SelectedNode {
                id: record.id,
                address: record.address.clone(),
            })
            .collect()
    }

    /// Returns the reliable set and its excluded-country subset.
    ///
    /// This is the refresh query behind the reliability cache; one scan
    /// produces both memberships so a snapshot is internally consistent.
    pub async fn reliability_sets(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(HashSet<NodeId>, HashSet<NodeId>)> {
        let window = self.online_window();
        let nodes = self.nodes.lock().expect("overlay lock poisoned");
        let mut reliable = HashSet::new();
        let mut excluded_country = HashSet::new();
        for record in nodes.values() {
            if !record.is_reliable(now, window) {
                continue;
            }
            reliable.insert(record.id);
            if self.in_excluded_country(record) {
                excluded_country.insert(record.id);
            }
        }
        Ok((reliable, excluded_country))
    }

    /// Picks nodes for a new upload or repair placement.
    ///
    /// Candidates are reliable, not exiting, outside excluded countries and
    /// not in the request's exclusion list. With subnet-distinct selection
    /// at most one node per /24 is returned and the exclusion list also
    /// shadows its subnets. Unvetted nodes fill at most the configured
    /// fraction of the request.
    pub async fn find_storage_nodes_for_upload(
        &self,
        req: &NodeSelectionRequest,
        now: DateTime<Utc>,
    ) -> Result<Vec<SelectedNode>> {
        let window = self.online_window();
        let excluded: HashSet<NodeId> = req.excluded.iter().copied().collect();
        let nodes = self.nodes.lock().expect("overlay lock poisoned");

        let excluded_subnets: HashSet<String> = if self.config.distinct_subnets {
            req.excluded
                .iter()
                .filter_map(|id| nodes.get(id))
                .map(|record| record.last_net.clone())
                .collect()
        } else {
            HashSet::new()
        };

        let mut candidates: Vec<&NodeRecord> = nodes
            .values()
            .filter(|record| {
                record.is_reliable(now, window)
                    && !record.is_exiting()
                    && !excluded.contains(&record.id)
                    && !self.in_excluded_country(record)
                    && !excluded_subnets.contains(&record.last_net)
            })
            .collect();
        candidates.shuffle(&mut rand::thread_rng());

        if self.config.distinct_subnets {
            let mut seen = HashSet::new();
            candidates.retain(|record| seen.insert(record.last_net.clone()));
        }

        let (vetted, new): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(|record| record.is_vetted());

        let new_count = (req.requested_count as f64 * self.config.new_node_fraction) as usize;
        let mut picked: Vec<SelectedNode> = Vec::with_capacity(req.requested_count);
        picked.extend(new.iter().take(new_count).map(|record| SelectedNode {
            id: record.id,
            address: record.address.clone(),
        }));
        picked.extend(
            vetted
                .iter()
                .take(req.requested_count - picked.len())
                .map(|record| SelectedNode {
                    id: record.id,
                    address: record.address.clone(),
                }),
        );
        // Backfill with remaining new nodes when vetted supply runs short.
        if picked.len() < req.requested_count {
            picked.extend(
                new.iter()
                    .skip(new_count)
                    .take(req.requested_count - picked.len())
                    .map(|record| SelectedNode {
                        id: record.id,
                        address: record.address.clone(),
                    }),
            );
        }

        if picked.len() < req.requested_count {
            return Err(OverlayError::NotEnoughNodes {
                requested: req.requested_count,
                available: picked.len(),
            });
        }
        Ok(picked)
    }

    /// Picks replacement nodes for graceful-exit transfers.
    pub async fn find_storage_nodes_for_graceful_exit(
        &self,
        req: &NodeSelectionRequest,
        now: DateTime<Utc>,
    ) -> Result<Vec<SelectedNode>> {
        self.find_storage_nodes_for_upload(req, now).await
    }

    /// Marks a node disqualified. Absorbing; the first reason sticks, and
    /// a node that finished graceful exit is never disqualified after.
    pub async fn disqualify_node(
        &self,
        id: NodeId,
        reason: DisqualificationReason,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut nodes = self.nodes.lock().expect("overlay lock poisoned");
        let record = nodes.get_mut(&id).ok_or(OverlayError::NodeNotFound(id))?;
        if record.is_disqualified() || record.has_exited() {
            return Ok(());
        }
        info!(node = %id, ?reason, "disqualifying node");
        record.disqualified_at = Some(now);
        record.disqualification_reason = Some(reason);
        Ok(())
    }

    /// Marks a node vetted. Returns whether this call set it.
    pub async fn set_vetted(&self, id: NodeId, now: DateTime<Utc>) -> Result<bool> {
        let mut nodes = self.nodes.lock().expect("overlay lock poisoned");
        let record = nodes.get_mut(&id).ok_or(OverlayError::NodeNotFound(id))?;
        if record.vetted_at.is_some() {
            return Ok(false);
        }
        info!(node = %id, "node vetted");
        record.vetted_at = Some(now);
        Ok(true)
    }

    pub async fn set_unknown_audit_suspension(
        &self,
        id: NodeId,
        suspended_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut nodes = self.nodes.lock().expect("overlay lock poisoned");
        let record = nodes.get_mut(&id).ok_or(OverlayError::NodeNotFound(id))?;
        record.unknown_audit_suspended_at = suspended_at;
        Ok(())
    }

    pub async fn set_offline_suspension(
        &self,
        id: NodeId,
        suspended_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut nodes = self.nodes.lock().expect("overlay lock poisoned");
        let record = nodes.get_mut(&id).ok_or(OverlayError::NodeNotFound(id))?;
        record.offline_suspended_at = suspended_at;
        Ok(())
    }

    /// Applies a partial exit-status update.
    pub async fn update_exit_status(&self, req: ExitStatusRequest) -> Result<()> {
        let mut nodes = self.nodes.lock().expect("overlay lock poisoned");
        let record = nodes
            .get_mut(&req.node_id)
            .ok_or(OverlayError::NodeNotFound(req.node_id))?;
        if let Some(initiated_at) = req.initiated_at {
            record.exit.initiated_at = Some(initiated_at);
        }
        if let Some(loop_completed_at) = req.loop_completed_at {
            record.exit.loop_completed_at = Some(loop_completed_at);
        }
        if let Some(finished_at) = req.finished_at {
            record.exit.finished_at = Some(finished_at);
        }
        if let Some(success) = req.success {
            record.exit.success = success;
        }
        Ok(())
    }

    /// Nodes whose exit has been initiated but not finished.
    pub async fn exiting_nodes(&self) -> Vec<NodeRecord> {
        self.nodes
            .lock()
            .expect("overlay lock poisoned")
            .values()
            .filter(|record| record.is_exiting())
            .cloned()
            .collect()
    }

    pub async fn update_piece_count(&self, id: NodeId, piece_count: u64) -> Result<()> {
        let mut nodes = self.nodes.lock().expect("overlay lock poisoned");
        let record = nodes.get_mut(&id).ok_or(OverlayError::NodeNotFound(id))?;
        record.piece_count = piece_count;
        Ok(())
    }

    /// Last-known piece counts of every node that reported any; sizes the
    /// garbage-collection Bloom filters.
    pub async fn piece_counts(&self) -> HashMap<NodeId, u64> {
        self.nodes
            .lock()
            .expect("overlay lock poisoned")
            .values()
            .filter(|record| record.piece_count > 0)
            .map(|record| (record.id, record.piece_count))
            .collect()
    }

    /// Subset of `ids` that is reliable but placed in an excluded country.
    pub async fn reliable_pieces_in_excluded_countries(
        &self,
        ids: &[NodeId],
        now: DateTime<Utc>,
    ) -> Vec<NodeId> {
        let window = self.online_window();
        let nodes = self.nodes.lock().expect("overlay lock poisoned");
        ids.iter()
            .filter_map(|id| nodes.get(id))
            .filter(|record| record.is_reliable(now, window) && self.in_excluded_country(record))
            .map(|record| record.id)
            .collect()
    }

    fn online_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.online_window)
            .unwrap_or_else(|_| chrono::Duration::hours(4))
    }

    fn in_excluded_country(&self, record: &NodeRecord) -> bool {
        record.country.as_ref().is_some_and(|country| {
            self.config
                .excluded_countries
                .iter()
                .any(|excluded| excluded.eq_ignore_ascii_case(country.as_str()))
        })
    }
}

/// Derives the /24 network key from an `ip:port` address.
pub(crate) fn subnet_of(address: &str) -> Result<String> {
    let host = address
        .rsplit_once(':')
        .map_or(address, |(host, _port)| host);
    let octets: Vec<&str> = host.split('.').collect();
    if octets.len() == 4 && octets.iter().all(|o| o.parse::<u8>().is_ok()) {
        Ok(format!("{}.{}.{}", octets[0], octets[1], octets[2]))
    } else if host.is_empty() {
        Err(OverlayError::InvalidAddress(address.to_string()))
    } else {
        // Hostnames and IPv6 fall back to the host as its own network.
        Ok(host.to_string())
    }
}
