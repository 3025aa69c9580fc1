//! Repair configuration.

use std::time::Duration;

use meridian_types::RedundancyScheme;
use serde::{Deserialize, Serialize};

/// Repair-threshold override for one exact redundancy scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairOverride {
    pub required: u16,
    pub optimal: u16,
    pub total: u16,
    /// Threshold to use instead of the scheme's own `repair`.
    pub repair_target: u16,
}

/// Tuning for the checker and the repairer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Interval of the checker pass.
    pub checker_interval: Duration,

    /// Interval of the repairer drain.
    pub repairer_interval: Duration,

    /// Fraction of extra replacement nodes requested beyond optimal, to
    /// absorb upload failures.
    pub max_excess_rate: f64,

    /// Per-scheme repair-threshold overrides, matched on the exact
    /// `(required, optimal, total)` tuple.
    pub overrides: Vec<RepairOverride>,

    /// Timeout for one piece download.
    pub download_timeout: Duration,

    /// Soft deadline for the upload fan-out; once enough uploads have
    /// succeeded the slow tail is cancelled.
    pub upload_timeout: Duration,
}

impl RepairConfig {
    /// Effective repair threshold for `scheme`.
    pub fn repair_threshold(&self, scheme: &RedundancyScheme) -> u16 {
        self.overrides
            .iter()
            .find(|o| {
                o.required == scheme.required
                    && o.optimal == scheme.optimal
                    && o.total == scheme.total
            })
            .map_or(scheme.repair, |o| o.repair_target)
    }
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            checker_interval: Duration::from_secs(60),
            repairer_interval: Duration::from_secs(15),
            max_excess_rate: 0.05,
            overrides: Vec::new(),
            download_timeout: Duration::from_secs(5 * 60),
            upload_timeout: Duration::from_secs(5 * 60),
        }
    }
}
