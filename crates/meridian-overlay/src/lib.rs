//! # meridian-overlay: Node directory for the Meridian satellite
//!
//! The overlay is the authoritative record of every storage node the
//! satellite has ever seen: address, country, vetting, suspension and
//! disqualification state, graceful-exit progress, and contact history.
//! On top of the directory it provides:
//!
//! - **Node selection** for uploads and repairs, mixing unvetted ("new")
//!   nodes into the vetted pool at a configured fraction and optionally
//!   enforcing one node per /24 subnet.
//! - **The reliability cache**: a lock-free snapshot of the currently
//!   reliable node IDs, refreshed on staleness or explicit invalidation.
//!   Repair and audit are hot consumers; they get a consistent membership
//!   test without touching the directory on every segment.

mod cache;
mod config;
mod error;
mod node;
mod service;

#[cfg(test)]
mod tests;

pub use cache::{ReliabilityCache, ReliabilitySnapshot};
pub use config::OverlayConfig;
pub use error::{OverlayError, Result};
pub use node::{
    CheckInInfo, DisqualificationReason, ExitStatus, ExitStatusRequest, NodeRecord, SelectedNode,
};
pub use service::{NodeSelectionRequest, Overlay};
