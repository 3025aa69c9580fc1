//! Cycle primitive for the satellite's background chores.
//!
//! Every long-running service in the satellite (audit chore, repair
//! checker, repairer, garbage collection, graceful exit, reliability
//! refresh) is a [`Cycle`]: an action run once immediately and then on a
//! fixed interval until shutdown. A [`CycleHandle`] lets tests and
//! operators trigger an immediate run, pause scheduling, or resume it.

use std::fmt::Display;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error};

/// Control messages accepted by a running cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Trigger,
    Pause,
    Resume,
}

/// Remote control for a [`Cycle`].
///
/// Cheap to clone; all clones steer the same loop. Commands sent after
/// the loop has shut down are silently dropped.
#[derive(Debug, Clone)]
pub struct CycleHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl CycleHandle {
    /// Runs the action once, immediately, even while paused.
    pub fn trigger(&self) {
        let _ = self.tx.send(Command::Trigger);
    }

    /// Stops interval scheduling. Manual triggers still run.
    pub fn pause(&self) {
        let _ = self.tx.send(Command::Pause);
    }

    /// Resumes interval scheduling.
    pub fn resume(&self) {
        let _ = self.tx.send(Command::Resume);
    }
}

/// Interval loop with external trigger/pause/restart controls.
pub struct Cycle {
    name: &'static str,
    interval: Duration,
    rx: mpsc::UnboundedReceiver<Command>,
    paused: bool,
    controls_open: bool,
}

impl Cycle {
    /// Creates a cycle and its control handle.
    pub fn new(name: &'static str, interval: Duration) -> (Self, CycleHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                name,
                interval,
                rx,
                paused: false,
                controls_open: true,
            },
            CycleHandle { tx },
        )
    }

    /// Drives `action` until `shutdown` flips to `true`.
    ///
    /// The action runs once immediately, then on every interval tick while
    /// not paused. Action errors are logged and never stop the loop; only
    /// shutdown returns.
    pub async fn run<F, Fut, E>(mut self, mut shutdown: watch::Receiver<bool>, mut action: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        if *shutdown.borrow() {
            return;
        }

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick(), if !self.paused => {
                    self.run_once(&mut action).await;
                }
                cmd = self.rx.recv(), if self.controls_open => {
                    match cmd {
                        Some(Command::Trigger) => self.run_once(&mut action).await,
                        Some(Command::Pause) => self.paused = true,
                        Some(Command::Resume) => {
                            self.paused = false;
                            ticker.reset();
                        }
                        None => self.controls_open = false,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(cycle = self.name, "cycle shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn run_once<F, Fut, E>(&self, action: &mut F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        if let Err(err) = action().await {
            error!(cycle = self.name, %err, "cycle action failed");
        }
    }
}
