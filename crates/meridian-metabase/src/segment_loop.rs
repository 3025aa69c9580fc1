//! Shared iterator over all segments.
//!
//! Audit collection, repair checking, garbage collection and graceful-exit
//! path collection all need one thing from the catalogue: every remote
//! segment, once. The segment loop multiplexes them: observers join, the
//! next pass feeds each of them every non-expired remote segment, and the
//! joiner gets its observer back together with the pass statistics.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, oneshot, watch};
use tracing::{debug, warn};

use crate::error::{MetabaseError, Result};
use crate::segment::Segment;
use crate::store::Metabase;

/// Receives every remote segment once per pass.
///
/// Observers run on the loop task; keep `on_segment` cheap and push heavy
/// work into the owning service after the pass completes.
pub trait SegmentObserver: Any + Send {
    fn on_segment(&mut self, segment: &Segment);
}

/// Segment loop configuration.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Rows fetched per range-scan batch.
    pub batch_size: usize,
    /// How long to wait after the first joiner for others to pile on.
    pub coalesce: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            batch_size: 2500,
            coalesce: Duration::from_secs(5),
        }
    }
}

/// Statistics of one completed pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Remote segments handed to observers.
    pub segments: usize,
    /// Inline segments skipped.
    pub inline_skipped: usize,
    /// Expired segments skipped.
    pub expired_skipped: usize,
}

struct Waiter {
    observer: Box<dyn SegmentObserver>,
    done: oneshot::Sender<(Box<dyn SegmentObserver>, PassStats)>,
}

/// Multiplexing iterator over the segment catalogue.
pub struct SegmentLoop {
    metabase: Arc<Metabase>,
    config: LoopConfig,
    waiting: Mutex<Vec<Waiter>>,
    joined: Notify,
}

impl SegmentLoop {
    pub fn new(metabase: Arc<Metabase>, config: LoopConfig) -> Self {
        Self {
            metabase,
            config,
            waiting: Mutex::new(Vec::new()),
            joined: Notify::new(),
        }
    }

    /// Rides `observer` through the next pass and returns it afterwards.
    ///
    /// Blocks until a pass including this observer completes, which
    /// requires the loop to be driven by [`SegmentLoop::run`] or by
    /// explicit [`SegmentLoop::run_once`] calls.
    pub async fn join<O: SegmentObserver>(&self, observer: O) -> Result<(O, PassStats)> {
        let (tx, rx) = oneshot::channel();
        self.waiting
            .lock()
            .expect("segment loop lock poisoned")
            .push(Waiter {
                observer: Box::new(observer),
                done: tx,
            });
        self.joined.notify_one();

        let (boxed, stats) = rx.await.map_err(|_| MetabaseError::LoopShutdown)?;
        let boxed: Box<dyn Any> = boxed;
        let observer = *boxed
            .downcast::<O>()
            .expect("segment loop returns the observer that joined");
        Ok((observer, stats))
    }

    /// Runs one pass over all currently waiting observers.
    ///
    /// A pass with no waiting observers scans nothing.
    pub async fn run_once(&self) -> PassStats {
        let mut waiters = {
            let mut waiting = self.waiting.lock().expect("segment loop lock poisoned");
            std::mem::take(&mut *waiting)
        };
        if waiters.is_empty() {
            return PassStats::default();
        }

        let stats = self.iterate(&mut waiters).await;
        debug!(
            observers = waiters.len(),
            segments = stats.segments,
            "segment loop pass complete"
        );
        for waiter in waiters {
            if waiter.done.send((waiter.observer, stats)).is_err() {
                warn!("segment loop joiner went away before pass completion");
            }
        }
        stats
    }

    /// Drives passes until shutdown, coalescing concurrent joiners.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.joined.notified() => {
                    // Let concurrent joiners pile on before scanning.
                    tokio::select! {
                        () = tokio::time::sleep(self.config.coalesce) => {}
                        () = wait_for_shutdown(&mut shutdown) => {
                            self.drop_waiters();
                            return;
                        }
                    }
                    self.run_once().await;
                }
                () = wait_for_shutdown(&mut shutdown) => {
                    self.drop_waiters();
                    return;
                }
            }
        }
    }

    /// Dropping the waiters wakes every joiner with `LoopShutdown`.
    fn drop_waiters(&self) {
        self.waiting
            .lock()
            .expect("segment loop lock poisoned")
            .clear();
    }

    async fn iterate(&self, waiters: &mut [Waiter]) -> PassStats {
        let now = chrono::Utc::now();
        let mut stats = PassStats::default();
        let mut cursor = None;

        loop {
            let (batch, next) = self
                .metabase
                .list_segments(cursor, self.config.batch_size)
                .await;
            for segment in &batch {
                if segment.is_inline() {
                    stats.inline_skipped += 1;
                    continue;
                }
                if segment.is_expired(now) {
                    stats.expired_skipped += 1;
                    continue;
                }
                stats.segments += 1;
                for waiter in waiters.iter_mut() {
                    waiter.observer.on_segment(segment);
                }
            }
            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        stats
    }
}

/// Resolves once `shutdown` flips to `true` or its sender is dropped.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use meridian_types::{NodeId, Piece, PieceId, Pieces, RedundancyScheme, SegmentPosition, StreamId};

    #[derive(Default)]
    struct CountingObserver {
        seen: usize,
    }

    impl SegmentObserver for CountingObserver {
        fn on_segment(&mut self, _segment: &Segment) {
            self.seen += 1;
        }
    }

    fn segment(pieces: usize, expires_at: Option<chrono::DateTime<Utc>>) -> Segment {
        Segment {
            stream_id: StreamId::generate(),
            position: SegmentPosition::new(0, 0),
            redundancy: RedundancyScheme {
                required: 2,
                repair: 3,
                optimal: 4,
                total: 8,
                share_size: 64,
            },
            root_piece_id: PieceId::generate(),
            ancestor_stream_id: None,
            encrypted_size: 512,
            pieces: (0..pieces)
                .map(|i| Piece {
                    number: i as u16,
                    node: NodeId::generate(),
                })
                .collect::<Pieces>(),
            created_at: Utc::now(),
            repaired_at: None,
            expires_at,
        }
    }

    #[tokio::test]
    async fn pass_feeds_remote_segments_and_skips_inline_and_expired() {
        let metabase = Arc::new(Metabase::new());
        metabase.insert_segment(segment(4, None)).await.unwrap();
        metabase.insert_segment(segment(4, None)).await.unwrap();
        metabase.insert_segment(segment(0, None)).await.unwrap();
        metabase
            .insert_segment(segment(4, Some(Utc::now() - chrono::Duration::hours(1))))
            .await
            .unwrap();

        let segment_loop = Arc::new(SegmentLoop::new(metabase, LoopConfig::default()));

        let join = {
            let segment_loop = segment_loop.clone();
            tokio::spawn(async move { segment_loop.join(CountingObserver::default()).await })
        };
        // Wait for the joiner to register before running the pass.
        tokio::task::yield_now().await;
        while segment_loop.waiting.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        segment_loop.run_once().await;

        let (observer, stats) = join.await.unwrap().unwrap();
        assert_eq!(observer.seen, 2);
        assert_eq!(stats.segments, 2);
        assert_eq!(stats.inline_skipped, 1);
        assert_eq!(stats.expired_skipped, 1);
    }

    #[tokio::test]
    async fn multiple_joiners_share_one_pass() {
        let metabase = Arc::new(Metabase::new());
        for _ in 0..3 {
            metabase.insert_segment(segment(4, None)).await.unwrap();
        }
        let segment_loop = Arc::new(SegmentLoop::new(
            metabase,
            LoopConfig {
                batch_size: 2,
                coalesce: Duration::from_millis(1),
            },
        ));

        let a = {
            let segment_loop = segment_loop.clone();
            tokio::spawn(async move { segment_loop.join(CountingObserver::default()).await })
        };
        let b = {
            let segment_loop = segment_loop.clone();
            tokio::spawn(async move { segment_loop.join(CountingObserver::default()).await })
        };
        while segment_loop.waiting.lock().unwrap().len() < 2 {
            tokio::task::yield_now().await;
        }
        segment_loop.run_once().await;

        let (obs_a, _) = a.await.unwrap().unwrap();
        let (obs_b, _) = b.await.unwrap().unwrap();
        assert_eq!(obs_a.seen, 3);
        assert_eq!(obs_b.seen, 3);
    }

    #[tokio::test]
    async fn shutdown_wakes_joiners_with_error() {
        let metabase = Arc::new(Metabase::new());
        let segment_loop = Arc::new(SegmentLoop::new(metabase, LoopConfig::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let runner = {
            let segment_loop = segment_loop.clone();
            tokio::spawn(async move { segment_loop.run(shutdown_rx).await })
        };
        let join = {
            let segment_loop = segment_loop.clone();
            tokio::spawn(async move { segment_loop.join(CountingObserver::default()).await })
        };
        while segment_loop.waiting.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap();
        assert!(matches!(
            join.await.unwrap(),
            Err(MetabaseError::LoopShutdown)
        ));
    }
}
