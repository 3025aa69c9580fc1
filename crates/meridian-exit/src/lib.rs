//! # meridian-exit: Graceful exit for the Meridian satellite
//!
//! A node leaving the network hands every piece it holds to replacement
//! nodes, one verified transfer at a time, before the overlay marks it
//! exited. The crate has three parts:
//!
//! - [`TransferQueue`]: one durable row per (exiting node, piece), filled
//!   by a segment-loop pass and consumed by the session.
//! - [`ExitChore`]: schedules the collection pass for freshly initiated
//!   exits, records loop completion, and fails out nodes that stall past
//!   the inactivity window.
//! - [`ExitEndpoint`]: the per-node session state machine
//!   (`Opening → NotReady → Transferring → Finishing`), at most one
//!   session per node, every handover verified against both nodes'
//!   signatures before the catalogue is updated.

mod chore;
mod config;
mod endpoint;
mod error;
mod queue;

pub use chore::{ExitChore, PathCollector};
pub use config::ExitConfig;
pub use endpoint::ExitEndpoint;
pub use error::{ExitError, Result};
pub use queue::{TransferItem, TransferQueue};
