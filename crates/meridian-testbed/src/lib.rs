//! # meridian-testbed: An in-process planet
//!
//! Spins up the full durability core against an in-memory metabase,
//! overlay, and a set of scriptable fake storage nodes wired through the
//! `NodeClient` seam. Nodes can be stopped, contained, or corrupted
//! byte-by-byte, and a [`NodeExitDriver`] plays the node side of a
//! graceful-exit session. The end-to-end scenario tests live in this
//! crate's `tests/` directory.

mod exit_driver;
mod network;
mod planet;

pub use exit_driver::{ExitBehavior, NodeExitDriver};
pub use network::{SabotageClient, TestNetwork, TestNode};
pub use planet::TestPlanet;
