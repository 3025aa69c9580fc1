//! Reputation configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning for the beta model and the status state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Forgetting factor applied to both beta pairs on every event.
    pub lambda: f64,
    /// Weight of a single audit event.
    pub weight: f64,
    /// Initial alpha of a fresh node.
    pub initial_alpha: f64,
    /// Initial beta of a fresh node.
    pub initial_beta: f64,

    /// Audit score below which a node is disqualified.
    pub audit_dq: f64,
    /// Unknown-audit score below which a node is suspended.
    pub suspension_threshold: f64,
    /// How long a node may stay suspended before disqualification.
    pub suspension_grace_period: Duration,
    /// Whether a lapsed unknown-audit suspension disqualifies.
    pub suspension_dq_enabled: bool,

    /// Total audits after which a node counts as vetted.
    pub audit_count: u64,

    /// Width of one online-history window.
    pub audit_history_window_size: Duration,
    /// Period over which window ratios are averaged.
    pub audit_history_tracking_period: Duration,
    /// Online average below which a node is offline-suspended.
    pub offline_threshold: f64,
    /// Whether offline suspension is applied at all.
    pub offline_suspension_enabled: bool,
    /// Whether a lapsed offline suspension disqualifies.
    pub offline_dq_enabled: bool,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            lambda: 0.95,
            weight: 1.0,
            // A fresh node starts with enough credit that one bad audit
            // cannot cross a threshold on its own.
            initial_alpha: 20.0,
            initial_beta: 0.0,
            audit_dq: 0.6,
            suspension_threshold: 0.6,
            suspension_grace_period: Duration::from_secs(7 * 24 * 60 * 60),
            suspension_dq_enabled: false,
            audit_count: 100,
            audit_history_window_size: Duration::from_secs(12 * 60 * 60),
            audit_history_tracking_period: Duration::from_secs(30 * 24 * 60 * 60),
            offline_threshold: 0.6,
            offline_suspension_enabled: true,
            offline_dq_enabled: false,
        }
    }
}
