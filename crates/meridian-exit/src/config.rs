//! Graceful-exit configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning for the exit chore and session endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    /// Interval of the scheduling chore.
    pub chore_interval: Duration,

    /// Minimum node age before an exit may begin.
    pub node_min_age: Duration,

    /// A node with no transfer progress for this long is failed out and
    /// its queue purged.
    pub max_inactive: Duration,

    /// Queue rows pulled per producer refill.
    pub endpoint_batch_size: usize,

    /// Per-piece failure cap before the piece counts as overall-failed.
    pub max_failures_per_piece: u32,

    /// Failure ratio at or above which the whole exit fails.
    pub overall_max_failures_percentage: f64,

    /// How long to wait for the node's next Succeeded/Failed.
    pub recv_timeout: Duration,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            chore_interval: Duration::from_secs(30),
            node_min_age: Duration::from_secs(180 * 24 * 60 * 60),
            max_inactive: Duration::from_secs(7 * 24 * 60 * 60),
            endpoint_batch_size: 300,
            max_failures_per_piece: 5,
            overall_max_failures_percentage: 0.1,
            recv_timeout: Duration::from_secs(60 * 60),
        }
    }
}
