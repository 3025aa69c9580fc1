//! # meridian-audit: Possession challenges for the Meridian satellite
//!
//! The audit pipeline proves, continuously and at random, that storage
//! nodes still hold the shares they were paid to hold:
//!
//! 1. The [`Collector`] rides the segment loop and fills one bounded
//!    [`Reservoir`] per node with randomly prioritised (segment, stripe)
//!    candidates.
//! 2. The [`AuditChore`] drains reservoirs into the FIFO [`AuditQueue`].
//! 3. The [`AuditWorker`] pops items, and the [`Verifier`] challenges
//!    every holder of the chosen stripe for its share, classifies each
//!    response, and cross-checks returned shares against the
//!    reconstructed stripe.
//! 4. The [`Reporter`] turns classifications into reputation updates and
//!    feeds deferred responders into [`Containment`] for later
//!    [`Verifier::reverify`] visits.

mod chore;
mod collector;
mod config;
mod containment;
mod error;
mod queue;
mod report;
mod reservoir;
mod verifier;
mod worker;

pub use chore::AuditChore;
pub use collector::Collector;
pub use config::AuditConfig;
pub use containment::{Containment, PendingAudit};
pub use error::{AuditError, Result};
pub use queue::AuditQueue;
pub use report::{AuditReport, Reporter};
pub use reservoir::{AuditItem, Reservoir};
pub use verifier::{Verifier, share_hash};
pub use worker::{AuditWorker, ReverifyWorker};
