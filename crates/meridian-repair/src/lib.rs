//! # meridian-repair: Keeping segments above their repair threshold
//!
//! The [`Checker`] rides the segment loop with a fresh reliability
//! snapshot and files every segment whose healthy-piece count has sunk to
//! its repair threshold into the durable [`RepairQueue`]. The
//! [`SegmentRepairer`] drains the queue under a strict **make it no
//! worse** contract: it re-reads and re-verifies everything against live
//! state, downloads any `required` healthy pieces (cancelling the long
//! tail), reconstructs, uploads to fresh nodes, and commits through the
//! metabase's compare-and-set, dropping its work silently whenever a
//! concurrent writer got there first.

mod checker;
mod config;
mod error;
mod queue;
mod repairer;

pub use checker::{Checker, CheckerObserver, CheckerStats};
pub use config::{RepairConfig, RepairOverride};
pub use error::{RepairError, Result};
pub use queue::{InjuredSegment, RepairQueue};
pub use repairer::{RepairStats, SegmentRepairer};
