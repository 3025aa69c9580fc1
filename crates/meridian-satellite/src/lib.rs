//! # meridian-satellite: Wiring the durability core
//!
//! Builds every service of the satellite core in topological order:
//! overlay → reputation → reliability cache → audit / repair / garbage
//! collection / graceful exit, over one metabase, one node-client
//! transport and one signing identity, then drives each chore as a
//! [`meridian_sync::Cycle`] until shutdown.

use std::sync::Arc;

use meridian_audit::{
    AuditChore, AuditQueue, AuditWorker, Containment, Reporter, ReverifyWorker, Verifier,
};
use meridian_config::SatelliteConfig;
use meridian_exit::{ExitChore, ExitEndpoint, TransferQueue};
use meridian_gc::GarbageCollector;
use meridian_metabase::{Metabase, SegmentLoop};
use meridian_orders::{OrderService, SatelliteIdentity};
use meridian_overlay::{Overlay, ReliabilityCache};
use meridian_piecestore::NodeClient;
use meridian_repair::{Checker, CheckerStats, RepairQueue, RepairStats, SegmentRepairer};
use meridian_reputation::ReputationService;
use meridian_sync::Cycle;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::info;

/// The assembled durability core.
///
/// Every field is shared; tests drive individual services directly while
/// production runs them all through [`Core::run`].
pub struct Core {
    pub config: SatelliteConfig,
    pub metabase: Arc<Metabase>,
    pub segment_loop: Arc<SegmentLoop>,
    pub overlay: Arc<Overlay>,
    pub reputation: Arc<ReputationService>,
    pub reliability_cache: Arc<ReliabilityCache>,
    pub orders: Arc<OrderService>,

    pub audit_queue: Arc<AuditQueue>,
    pub audit_chore: Arc<AuditChore>,
    pub audit_worker: Arc<AuditWorker>,
    pub reverify_worker: Arc<ReverifyWorker>,
    pub containment: Arc<Containment>,

    pub repair_queue: Arc<RepairQueue>,
    pub checker: Arc<Checker>,
    pub checker_stats: Arc<CheckerStats>,
    pub repairer: Arc<SegmentRepairer>,
    pub repair_stats: Arc<RepairStats>,

    pub gc: Arc<GarbageCollector>,

    pub transfer_queue: Arc<TransferQueue>,
    pub exit_chore: Arc<ExitChore>,
    pub exit_endpoint: Arc<ExitEndpoint>,
}

impl Core {
    /// Constructs the core over its external collaborators.
    pub fn new(
        config: SatelliteConfig,
        identity: SatelliteIdentity,
        metabase: Arc<Metabase>,
        client: Arc<dyn NodeClient>,
    ) -> Self {
        let identity = Arc::new(identity);
        let segment_loop = Arc::new(SegmentLoop::new(metabase.clone(), config.segment_loop));

        let overlay = Arc::new(Overlay::new(config.overlay.clone()));
        let reputation = Arc::new(ReputationService::new(
            config.reputation.clone(),
            overlay.clone(),
        ));
        let reliability_cache = Arc::new(ReliabilityCache::new(overlay.clone()));
        let orders = Arc::new(OrderService::new(
            config.orders.clone(),
            identity,
            overlay.clone(),
        ));

        let containment = Arc::new(Containment::new(reputation.clone()));
        let audit_queue = Arc::new(AuditQueue::new());
        let audit_chore = Arc::new(AuditChore::new(
            segment_loop.clone(),
            audit_queue.clone(),
            config.audit.clone(),
        ));
        let verifier = Arc::new(Verifier::new(
            metabase.clone(),
            orders.clone(),
            client.clone(),
            containment.clone(),
            config.audit.clone(),
        ));
        let reporter = Arc::new(Reporter::new(reputation.clone(), containment.clone()));
        let audit_worker = Arc::new(AuditWorker::new(
            audit_queue.clone(),
            verifier.clone(),
            reporter.clone(),
            config.audit.clone(),
        ));
        let reverify_worker = Arc::new(ReverifyWorker::new(
            containment.clone(),
            verifier,
            reporter,
        ));

        let repair_queue = Arc::new(RepairQueue::new());
        let checker_stats = Arc::new(CheckerStats::default());
        let checker = Arc::new(Checker::new(
            segment_loop.clone(),
            reliability_cache.clone(),
            repair_queue.clone(),
            config.repair.clone(),
            checker_stats.clone(),
        ));
        let repair_stats = Arc::new(RepairStats::default());
        let repairer = Arc::new(SegmentRepairer::new(
            metabase.clone(),
            overlay.clone(),
            reliability_cache.clone(),
            orders.clone(),
            reputation.clone(),
            client.clone(),
            repair_queue.clone(),
            config.repair.clone(),
            repair_stats.clone(),
        ));

        let gc = Arc::new(GarbageCollector::new(
            segment_loop.clone(),
            overlay.clone(),
            client,
            config.gc.clone(),
        ));

        let transfer_queue = Arc::new(TransferQueue::new());
        let exit_chore = Arc::new(ExitChore::new(
            segment_loop.clone(),
            overlay.clone(),
            transfer_queue.clone(),
            config.exit.clone(),
        ));
        let exit_endpoint = Arc::new(ExitEndpoint::new(
            metabase.clone(),
            overlay.clone(),
            orders.clone(),
            transfer_queue.clone(),
            config.exit.clone(),
        ));

        Self {
            config,
            metabase,
            segment_loop,
            overlay,
            reputation,
            reliability_cache,
            orders,
            audit_queue,
            audit_chore,
            audit_worker,
            reverify_worker,
            containment,
            repair_queue,
            checker,
            checker_stats,
            repairer,
            repair_stats,
            gc,
            transfer_queue,
            exit_chore,
            exit_endpoint,
        }
    }

    /// Runs every background loop until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!("satellite durability core starting");
        let mut tasks = JoinSet::new();

        {
            let segment_loop = self.segment_loop.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { segment_loop.run(shutdown).await });
        }

        let audit = self.config.audit.clone();
        spawn_cycle(&mut tasks, "audit-chore", audit.chore_interval, shutdown.clone(), {
            let chore = self.audit_chore.clone();
            move || {
                let chore = chore.clone();
                async move { chore.run_once().await }
            }
        });
        spawn_cycle(&mut tasks, "audit-worker", audit.worker_interval, shutdown.clone(), {
            let worker = self.audit_worker.clone();
            move || {
                let worker = worker.clone();
                async move { worker.run_once().await }
            }
        });
        spawn_cycle(&mut tasks, "audit-reverify", audit.worker_interval, shutdown.clone(), {
            let worker = self.reverify_worker.clone();
            move || {
                let worker = worker.clone();
                async move { worker.run_once().await }
            }
        });

        let repair = self.config.repair.clone();
        spawn_cycle(&mut tasks, "repair-checker", repair.checker_interval, shutdown.clone(), {
            let checker = self.checker.clone();
            move || {
                let checker = checker.clone();
                async move { checker.run_once().await }
            }
        });
        spawn_cycle(&mut tasks, "repairer", repair.repairer_interval, shutdown.clone(), {
            let repairer = self.repairer.clone();
            move || {
                let repairer = repairer.clone();
                async move { repairer.run_once().await }
            }
        });

        spawn_cycle(&mut tasks, "gc", self.config.gc.interval, shutdown.clone(), {
            let gc = self.gc.clone();
            move || {
                let gc = gc.clone();
                async move { gc.run_once().await.map(|_| ()) }
            }
        });

        spawn_cycle(&mut tasks, "exit-chore", self.config.exit.chore_interval, shutdown, {
            let chore = self.exit_chore.clone();
            move || {
                let chore = chore.clone();
                async move { chore.run_once().await }
            }
        });

        while tasks.join_next().await.is_some() {}
        info!("satellite durability core stopped");
    }
}

fn spawn_cycle<F, Fut, E>(
    tasks: &mut JoinSet<()>,
    name: &'static str,
    interval: std::time::Duration,
    shutdown: watch::Receiver<bool>,
    action: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send,
    E: std::fmt::Display + Send + 'static,
{
    let (cycle, _handle) = Cycle::new(name, interval);
    tasks.spawn(async move {
        cycle.run(shutdown, action).await;
    });
}
