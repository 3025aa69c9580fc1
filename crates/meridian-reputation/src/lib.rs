//! # meridian-reputation: Node scoring for the Meridian satellite
//!
//! Every audit outcome flows through here. Two beta reputations are kept
//! per node (one for hard audit failures, one for unknown transport
//! errors) plus an online-history ring that averages per-window online
//! ratios over a tracking period. Crossing a threshold drives the node
//! status machine: vetting, suspension (recoverable), and
//! disqualification (absorbing). Status changes propagate to the overlay,
//! which is the authority other subsystems read.

mod config;
mod error;
mod history;
mod service;

pub use config::ReputationConfig;
pub use error::{ReputationError, Result};
pub use history::AuditHistory;
pub use service::{ReputationRecord, ReputationService};
