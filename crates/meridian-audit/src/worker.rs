//! Audit and reverify workers.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::warn;

use crate::config::AuditConfig;
use crate::containment::Containment;
use crate::error::Result;
use crate::queue::AuditQueue;
use crate::report::Reporter;
use crate::verifier::Verifier;

/// Drains the audit queue with bounded concurrency.
pub struct AuditWorker {
    queue: Arc<AuditQueue>,
    verifier: Arc<Verifier>,
    reporter: Arc<Reporter>,
    config: AuditConfig,
}

impl AuditWorker {
    pub fn new(
        queue: Arc<AuditQueue>,
        verifier: Arc<Verifier>,
        reporter: Arc<Reporter>,
        config: AuditConfig,
    ) -> Self {
        Self {
            queue,
            verifier,
            reporter,
            config,
        }
    }

    /// Processes the whole current queue.
    ///
    /// A single failing audit is logged and does not stop the pass.
    pub async fn run_once(&self) -> Result<()> {
        let mut join_set: JoinSet<()> = JoinSet::new();
        loop {
            while join_set.len() < self.config.worker_concurrency.max(1) {
                let Some(item) = self.queue.pop() else { break };
                let verifier = self.verifier.clone();
                let reporter = self.reporter.clone();
                join_set.spawn(async move {
                    match verifier.verify(&item).await {
                        Ok(report) => {
                            if let Err(err) = reporter.record(report).await {
                                warn!(stream = %item.stream_id, %err, "recording audit failed");
                            }
                        }
                        Err(err) => {
                            warn!(stream = %item.stream_id, %err, "audit failed");
                        }
                    }
                });
            }
            if join_set.join_next().await.is_none() {
                break;
            }
        }
        Ok(())
    }
}

/// Revisits every contained node once per pass.
pub struct ReverifyWorker {
    containment: Arc<Containment>,
    verifier: Arc<Verifier>,
    reporter: Arc<Reporter>,
}

impl ReverifyWorker {
    pub fn new(
        containment: Arc<Containment>,
        verifier: Arc<Verifier>,
        reporter: Arc<Reporter>,
    ) -> Self {
        Self {
            containment,
            verifier,
            reporter,
        }
    }

    /// One reverification sweep over all pending audits.
    pub async fn run_once(&self) -> Result<()> {
        for pending in self.containment.all().await {
            match self.verifier.reverify(&pending).await {
                Ok(report) => self.reporter.record(report).await?,
                Err(err) => {
                    warn!(node = %pending.node, %err, "reverify failed");
                }
            }
        }
        Ok(())
    }
}
