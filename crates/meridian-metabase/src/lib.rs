//! # meridian-metabase: Segment catalogue for the Meridian satellite
//!
//! The metabase owns the segment rows of every object stored on the
//! network: redundancy scheme, root piece ID, expiry, and the ordered set
//! of pieces. Two properties matter to every other subsystem:
//!
//! - **Compare-and-set piece updates.** [`Metabase::update_segment_pieces`]
//!   only commits when the caller's view of the piece set still matches
//!   the row. This is the sole coordination point between repair,
//!   graceful exit and user deletes: the losing writer observes
//!   [`MetabaseError::Changed`] and drops its work item.
//! - **The segment loop.** [`SegmentLoop`] hands every remote segment to
//!   every joined observer exactly once per pass, multiplexing audit
//!   collection, repair checking, garbage collection and graceful-exit
//!   path collection over a single scan.

mod error;
mod segment;
mod segment_loop;
mod store;

pub use error::{MetabaseError, Result};
pub use segment::Segment;
pub use segment_loop::{LoopConfig, PassStats, SegmentLoop, SegmentObserver};
pub use store::{Metabase, UpdateSegmentPieces};
