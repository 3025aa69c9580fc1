//! Applying audit outcomes to reputation.

use std::sync::Arc;

use chrono::Utc;
use meridian_reputation::ReputationService;
use meridian_types::{AuditOutcome, NodeId};
use tracing::warn;

use crate::containment::{Containment, PendingAudit};
use crate::error::Result;

/// Classified outcomes of one audit.
#[derive(Debug, Default)]
pub struct AuditReport {
    pub successes: Vec<NodeId>,
    pub failures: Vec<NodeId>,
    pub offlines: Vec<NodeId>,
    pub unknowns: Vec<NodeId>,
    /// Deferred responders to insert into containment.
    pub pending_audits: Vec<PendingAudit>,
    /// Fewer than `required` shares arrived; nothing was scored.
    pub not_enough_shares: bool,
}

impl AuditReport {
    pub fn is_empty(&self) -> bool {
        self.successes.is_empty()
            && self.failures.is_empty()
            && self.offlines.is_empty()
            && self.unknowns.is_empty()
            && self.pending_audits.is_empty()
    }
}

/// Feeds audit reports into reputation and containment.
///
/// A node whose reputation update fails is retried a bounded number of
/// times; a node still failing is logged and dropped, and the next audit
/// will score it again.
pub struct Reporter {
    reputation: Arc<ReputationService>,
    containment: Arc<Containment>,
    max_retries: usize,
}

impl Reporter {
    pub fn new(reputation: Arc<ReputationService>, containment: Arc<Containment>) -> Self {
        Self {
            reputation,
            containment,
            max_retries: 3,
        }
    }

    /// Records every outcome in `report`.
    pub async fn record(&self, report: AuditReport) -> Result<()> {
        self.apply(&report.successes, AuditOutcome::Success).await;
        self.apply(&report.failures, AuditOutcome::Failure).await;
        self.apply(&report.offlines, AuditOutcome::Offline).await;
        self.apply(&report.unknowns, AuditOutcome::Unknown).await;

        for pending in report.pending_audits {
            self.containment.increment_pending(pending).await;
        }
        Ok(())
    }

    async fn apply(&self, nodes: &[NodeId], outcome: AuditOutcome) {
        let now = Utc::now();
        for &node in nodes {
            let mut attempts = 0;
            loop {
                attempts += 1;
                match self.reputation.apply_audit(node, outcome, now).await {
                    Ok(()) => break,
                    Err(err) if attempts < self.max_retries => {
                        warn!(node = %node, %err, attempts, "retrying reputation update");
                    }
                    Err(err) => {
                        warn!(node = %node, %err, "dropping reputation update");
                        break;
                    }
                }
            }
        }
    }
}
