//! Node records and their lifecycle.

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::VerifyingKey;
use meridian_types::{CountryCode, NodeId};

/// Why a node was disqualified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisqualificationReason {
    /// Audit reputation fell below the disqualification threshold.
    AuditFailure,
    /// Unknown-audit suspension outlasted the grace period.
    UnknownAudit,
    /// Offline suspension outlasted the grace period.
    Offline,
    /// Graceful exit ended with too many failed transfers.
    ExitFailure,
}

/// Graceful-exit progress of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitStatus {
    pub initiated_at: Option<DateTime<Utc>>,
    pub loop_completed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: bool,
}

/// Partial update to a node's exit status. `None` fields are untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitStatusRequest {
    pub node_id: NodeId,
    pub initiated_at: Option<DateTime<Utc>>,
    pub loop_completed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
}

impl ExitStatusRequest {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Self::default()
        }
    }
}

/// Data a node reports when checking in.
#[derive(Debug, Clone)]
pub struct CheckInInfo {
    pub id: NodeId,
    /// Dialable address, `ip:port`.
    pub address: String,
    pub country: Option<CountryCode>,
    /// Identity key the node signs piece hashes with.
    pub verifying_key: Option<VerifyingKey>,
}

/// Directory row for one storage node.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: NodeId,
    pub address: String,
    /// /24 network of the last known address, used for subnet-distinct
    /// selection.
    pub last_net: String,
    pub country: Option<CountryCode>,
    pub verifying_key: Option<VerifyingKey>,
    pub created_at: DateTime<Utc>,
    pub vetted_at: Option<DateTime<Utc>>,
    pub disqualified_at: Option<DateTime<Utc>>,
    pub disqualification_reason: Option<DisqualificationReason>,
    pub unknown_audit_suspended_at: Option<DateTime<Utc>>,
    pub offline_suspended_at: Option<DateTime<Utc>>,
    pub exit: ExitStatus,
    /// Last piece count the node reported; sizes its GC Bloom filter.
    pub piece_count: u64,
    pub last_contact_success: DateTime<Utc>,
    pub last_contact_failure: Option<DateTime<Utc>>,
}

impl NodeRecord {
    pub fn is_disqualified(&self) -> bool {
        self.disqualified_at.is_some()
    }

    /// Exit has been initiated and has not finished.
    pub fn is_exiting(&self) -> bool {
        self.exit.initiated_at.is_some() && self.exit.finished_at.is_none()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.finished_at.is_some()
    }

    pub fn is_suspended(&self) -> bool {
        self.unknown_audit_suspended_at.is_some() || self.offline_suspended_at.is_some()
    }

    pub fn is_online(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now.signed_duration_since(self.last_contact_success) <= window
    }

    /// The membership test behind the reliable set: not disqualified, not
    /// exited, not suspended, and contacted within the online window.
    pub fn is_reliable(&self, now: DateTime<Utc>, window: Duration) -> bool {
        !self.is_disqualified() && !self.has_exited() && !self.is_suspended()
            && self.is_online(now, window)
    }

    pub fn is_vetted(&self) -> bool {
        self.vetted_at.is_some()
    }
}

/// A node chosen by selection, with what callers need to dial it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedNode {
    pub id: NodeId,
    pub address: String,
}
