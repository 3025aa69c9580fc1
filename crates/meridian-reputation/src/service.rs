//! The reputation service.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use meridian_overlay::{DisqualificationReason, Overlay};
use meridian_types::{AuditOutcome, NodeId};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::ReputationConfig;
use crate::error::Result;
use crate::history::AuditHistory;

/// Per-node reputation state.
#[derive(Debug, Clone)]
pub struct ReputationRecord {
    pub audit_alpha: f64,
    pub audit_beta: f64,
    pub unknown_audit_alpha: f64,
    pub unknown_audit_beta: f64,
    pub total_audit_count: u64,
    pub audit_success_count: u64,
    pub online_score: f64,
    /// Set while the node owes a deferred audit response.
    pub contained: bool,
    pub vetted_at: Option<DateTime<Utc>>,
    pub disqualified_at: Option<DateTime<Utc>>,
    pub unknown_audit_suspended_at: Option<DateTime<Utc>>,
    pub offline_suspended_at: Option<DateTime<Utc>>,
    history: AuditHistory,
}

impl ReputationRecord {
    fn new(config: &ReputationConfig) -> Self {
        Self {
            audit_alpha: config.initial_alpha,
            audit_beta: config.initial_beta,
            unknown_audit_alpha: config.initial_alpha,
            unknown_audit_beta: config.initial_beta,
            total_audit_count: 0,
            audit_success_count: 0,
            online_score: 1.0,
            contained: false,
            vetted_at: None,
            disqualified_at: None,
            unknown_audit_suspended_at: None,
            offline_suspended_at: None,
            history: AuditHistory::new(
                config.audit_history_window_size,
                config.audit_history_tracking_period,
            ),
        }
    }

    /// Probability-of-success estimate from the audit beta pair.
    pub fn audit_score(&self) -> f64 {
        self.audit_alpha / (self.audit_alpha + self.audit_beta)
    }

    /// Same estimate for unknown-error behaviour.
    pub fn unknown_audit_score(&self) -> f64 {
        self.unknown_audit_alpha / (self.unknown_audit_alpha + self.unknown_audit_beta)
    }
}

/// Applies audit outcomes and drives the node status machine.
///
/// Construction order is topological: the service holds the overlay and
/// pushes every status transition (vetting, suspension, disqualification)
/// into it, so placement and the reliability cache observe one authority.
pub struct ReputationService {
    config: ReputationConfig,
    overlay: Arc<Overlay>,
    records: Mutex<HashMap<NodeId, ReputationRecord>>,
}

impl ReputationService {
    pub fn new(config: ReputationConfig, overlay: Arc<Overlay>) -> Self {
        Self {
            config,
            overlay,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Current record for `node`; a fresh default if never audited.
    pub async fn get(&self, node: NodeId) -> ReputationRecord {
        self.records
            .lock()
            .await
            .get(&node)
            .cloned()
            .unwrap_or_else(|| ReputationRecord::new(&self.config))
    }

    /// Marks or clears the contained flag.
    ///
    /// Only the containment component calls this; applying an audit never
    /// clears containment.
    pub async fn set_contained(&self, node: NodeId, contained: bool) {
        let mut records = self.records.lock().await;
        records
            .entry(node)
            .or_insert_with(|| ReputationRecord::new(&self.config))
            .contained = contained;
    }

    /// Applies one audit outcome to `node` as of `now`.
    pub async fn apply_audit(&self, node: NodeId, outcome: AuditOutcome, now: DateTime<Utc>) -> Result<()> {
        if outcome == AuditOutcome::Contained {
            // Containment is bookkeeping, not evidence.
            return Ok(());
        }

        let mut records = self.records.lock().await;
        let record = records
            .entry(node)
            .or_insert_with(|| ReputationRecord::new(&self.config));

        if record.disqualified_at.is_some() {
            return Ok(());
        }

        record.history.add_audit(outcome != AuditOutcome::Offline, now);
        record.online_score = record.history.online_score();
        record.total_audit_count += 1;

        let lambda = self.config.lambda;
        let weight = self.config.weight;
        match outcome {
            AuditOutcome::Success => {
                record.audit_success_count += 1;
                record.audit_alpha = lambda * record.audit_alpha + weight;
                record.audit_beta = lambda * record.audit_beta;
                record.unknown_audit_alpha = lambda * record.unknown_audit_alpha + weight;
                record.unknown_audit_beta = lambda * record.unknown_audit_beta;
            }
            AuditOutcome::Failure => {
                record.audit_alpha = lambda * record.audit_alpha;
                record.audit_beta = lambda * record.audit_beta + weight;
            }
            AuditOutcome::Unknown => {
                record.unknown_audit_alpha = lambda * record.unknown_audit_alpha;
                record.unknown_audit_beta = lambda * record.unknown_audit_beta + weight;
            }
            AuditOutcome::Offline => {}
            AuditOutcome::Contained => unreachable!("handled above"),
        }
        debug!(
            node = %node,
            ?outcome,
            audit_score = record.audit_score(),
            unknown_score = record.unknown_audit_score(),
            online_score = record.online_score,
            "applied audit outcome"
        );

        self.run_transitions(node, record, now).await
    }

    async fn run_transitions(
        &self,
        node: NodeId,
        record: &mut ReputationRecord,
        now: DateTime<Utc>,
    ) -> Result<()> {
        // Vetting happens once, regardless of score.
        if record.vetted_at.is_none() && record.total_audit_count >= self.config.audit_count {
            record.vetted_at = Some(now);
            self.overlay.set_vetted(node, now).await?;
        }

        if record.audit_score() < self.config.audit_dq {
            return self
                .disqualify(node, record, DisqualificationReason::AuditFailure, now)
                .await;
        }

        // Unknown-audit suspension with grace-period escalation.
        if record.unknown_audit_score() < self.config.suspension_threshold {
            match record.unknown_audit_suspended_at {
                None => {
                    info!(node = %node, "suspending node for unknown audit errors");
                    record.unknown_audit_suspended_at = Some(now);
                    self.overlay
                        .set_unknown_audit_suspension(node, Some(now))
                        .await?;
                }
                Some(since) => {
                    if self.config.suspension_dq_enabled
                        && now.signed_duration_since(since) > self.grace_period()
                    {
                        return self
                            .disqualify(node, record, DisqualificationReason::UnknownAudit, now)
                            .await;
                    }
                }
            }
        } else if record.unknown_audit_suspended_at.is_some() {
            info!(node = %node, "lifting unknown-audit suspension");
            record.unknown_audit_suspended_at = None;
            self.overlay.set_unknown_audit_suspension(node, None).await?;
        }

        // Offline suspension from the online-history average.
        if self.config.offline_suspension_enabled
            && record.online_score < self.config.offline_threshold
        {
            match record.offline_suspended_at {
                None => {
                    info!(node = %node, score = record.online_score, "suspending offline node");
                    record.offline_suspended_at = Some(now);
                    self.overlay.set_offline_suspension(node, Some(now)).await?;
                }
                Some(since) => {
                    if self.config.offline_dq_enabled
                        && now.signed_duration_since(since) > self.grace_period()
                    {
                        return self
                            .disqualify(node, record, DisqualificationReason::Offline, now)
                            .await;
                    }
                }
            }
        } else if record.offline_suspended_at.is_some() {
            info!(node = %node, "lifting offline suspension");
            record.offline_suspended_at = None;
            self.overlay.set_offline_suspension(node, None).await?;
        }

        Ok(())
    }

    async fn disqualify(
        &self,
        node: NodeId,
        record: &mut ReputationRecord,
        reason: DisqualificationReason,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.overlay.disqualify_node(node, reason, now).await?;
        // Gracefully exited nodes are spared; mirror the overlay's verdict.
        if self.overlay.get(node).await?.is_disqualified() {
            record.disqualified_at = Some(now);
        }
        Ok(())
    }

    fn grace_period(&self) -> Duration {
        Duration::from_std(self.config.suspension_grace_period)
            .unwrap_or_else(|_| Duration::days(7))
    }
}
