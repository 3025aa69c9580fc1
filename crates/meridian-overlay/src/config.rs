//! Overlay configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the node directory and reliability cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// A node whose last successful contact is older than this is treated
    /// as offline and excluded from the reliable set.
    pub online_window: Duration,

    /// Fraction of each selection request served from unvetted nodes.
    pub new_node_fraction: f64,

    /// Enforce at most one selected node per /24 subnet.
    pub distinct_subnets: bool,

    /// Country codes whose nodes are never counted as healthy for
    /// placement. Pieces already stored there are kept but repair and the
    /// checker treat them as out of placement.
    pub excluded_countries: Vec<String>,

    /// Maximum age of a reliability snapshot before reads refresh it.
    pub cache_staleness: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            online_window: Duration::from_secs(4 * 60 * 60),
            new_node_fraction: 0.05,
            distinct_subnets: true,
            excluded_countries: Vec::new(),
            cache_staleness: Duration::from_secs(5 * 60),
        }
    }
}
