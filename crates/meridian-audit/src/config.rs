//! Audit configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning for the audit pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Candidate slots per node reservoir.
    pub reservoir_slots: usize,

    /// Interval of the collection chore.
    pub chore_interval: Duration,

    /// Interval of the verification worker.
    pub worker_interval: Duration,

    /// Concurrent audits a worker pass runs.
    pub worker_concurrency: usize,

    /// Timeout for fetching one erasure share.
    pub share_timeout: Duration,

    /// Reverify attempts before a contained node fails the piece.
    pub max_reverify_count: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            reservoir_slots: 3,
            chore_interval: Duration::from_secs(30),
            worker_interval: Duration::from_secs(10),
            worker_concurrency: 2,
            share_timeout: Duration::from_secs(5 * 60),
            max_reverify_count: 3,
        }
    }
}
