//! Scheduler layer
//!
//! One periodic control loop per master process. Each cycle:
//! 1. marks workers without a recent heartbeat offline
//! 2. dispatches the ready and stalled work to the queue handlers
//! 3. reconciles stale in-progress instances with their backends
//!
//! Several masters may run the loop against the same store; the
//! compare-and-set claims and the shared markers keep them apart.

pub mod dispatch;
pub mod liveness;

pub use dispatch::DispatchReport;
pub use liveness::LivenessReport;

use anyhow::{Context as AnyhowContext, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::time;
use tracing::{debug, error, info};

use crate::context::SchedulerContext;
use crate::selector;

/// Outcome of one loop iteration
#[derive(Debug, Default)]
pub struct CycleReport {
    pub workers_offline: u64,
    pub dispatch: DispatchReport,
    pub liveness: LivenessReport,
}

/// The dispatch loop
pub struct Dispatcher {
    ctx: Arc<SchedulerContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        Self { ctx }
    }

    /// Runs the loop forever
    pub async fn run(&self) {
        info!(
            "Starting dispatch loop (interval: {:?}, handlers: {})",
            self.ctx.config.dispatch_interval,
            self.ctx.handlers.names().join(", ")
        );

        let mut interval = time::interval(self.ctx.config.dispatch_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            match self.run_cycle().await {
                Ok(report) => {
                    if report.dispatch.sent > 0 || report.liveness.reclaimed > 0 {
                        info!(
                            "Cycle: {} dispatched, {} deferred, {} failed, {} reclaimed",
                            report.dispatch.sent,
                            report.dispatch.deferred,
                            report.dispatch.failed,
                            report.liveness.reclaimed
                        );
                    } else {
                        debug!("Cycle: nothing dispatched");
                    }
                }
                Err(e) => {
                    error!("Error during dispatch cycle: {:#}", e);
                }
            }
        }
    }

    /// Performs a single cycle
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let ctx = self.ctx.as_ref();
        let mut report = CycleReport::default();

        let offline_cutoff = Utc::now()
            - chrono::Duration::from_std(ctx.config.worker_offline_after)
                .context("worker_offline_after out of range")?;
        report.workers_offline = ctx
            .store
            .mark_stale_workers_offline(offline_cutoff)
            .await
            .context("Failed to mark stale workers offline")?;
        if report.workers_offline > 0 {
            info!("Marked {} worker(s) offline", report.workers_offline);
        }

        let workers = ctx
            .store
            .list_workers()
            .await
            .context("Failed to list workers")?;

        let work = selector::fetch_work(ctx.store.as_ref())
            .await
            .context("Failed to fetch work")?;
        report.dispatch = dispatch::dispatch_work(ctx, &work, &workers).await;

        report.liveness = liveness::reconcile(ctx, &workers)
            .await
            .context("Failed to reconcile in-progress work")?;

        Ok(report)
    }
}
