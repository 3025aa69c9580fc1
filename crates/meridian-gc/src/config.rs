//! Garbage-collection configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning for filter construction and retain dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Interval between collection cycles.
    pub interval: Duration,

    /// Bloom-filter false-positive rate. Only over-retention; never
    /// deletion of live pieces.
    pub false_positive_rate: f64,

    /// Filter size fallback for nodes with no known piece count.
    pub default_piece_count: u64,

    /// Concurrent retain sends.
    pub concurrent_sends: usize,

    /// Timeout for one retain send.
    pub retain_send_timeout: Duration,

    /// How far `creation_date` is moved back to tolerate clock skew
    /// between satellite and nodes.
    pub skew_buffer: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(24 * 60 * 60),
            false_positive_rate: 0.1,
            default_piece_count: 10_000,
            concurrent_sends: 4,
            retain_send_timeout: Duration::from_secs(60),
            skew_buffer: Duration::from_secs(30 * 60),
        }
    }
}
