//! Periodic outbox flush.
//!
//! Each tick expires held ops (requesting a resync where ops were lost)
//! and then sends every due outbound delivery. Spawn [`DeliveryScheduler::run`]
//! as a tokio task and flip the `watch` channel to stop it. `Transport` is
//! blocking, so each tick runs on the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::crdt::ops::now_ms;
use crate::error::Result;
use crate::manager::{FlushReport, GroupManager};

pub struct DeliveryScheduler {
    manager: Arc<GroupManager>,
    interval: Duration,
}

impl DeliveryScheduler {
    pub fn new(manager: Arc<GroupManager>, interval_ms: u64) -> Self {
        DeliveryScheduler {
            manager,
            interval: Duration::from_millis(interval_ms.max(1)),
        }
    }

    /// Uses the manager's configured `flush_interval_ms`.
    pub fn from_config(manager: Arc<GroupManager>) -> Self {
        let interval_ms = manager.config().flush_interval_ms;
        Self::new(manager, interval_ms)
    }

    /// Run until `shutdown` turns `true` or its sender is dropped.
    ///
    /// ```ignore
    /// let (stop, rx) = tokio::sync::watch::channel(false);
    /// tokio::spawn(DeliveryScheduler::from_config(manager).run(rx));
    /// ```
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        log::info!("Delivery scheduler started ({:?} tick)", self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let manager = self.manager.clone();
                    match tokio::task::spawn_blocking(move || tick(&manager)).await {
                        Ok(Ok(report)) if report.delivered + report.failed > 0 => {
                            log::debug!(
                                "Outbox flush: {} delivered, {} failed",
                                report.delivered,
                                report.failed
                            );
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => log::warn!("Delivery scheduler tick failed: {}", e),
                        Err(e) => log::error!("Delivery scheduler tick aborted: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("Delivery scheduler stopped");
    }

    /// One pass on the calling thread: maintenance, then flush.
    pub fn tick(&self) -> Result<FlushReport> {
        tick(&self.manager)
    }
}

fn tick(manager: &GroupManager) -> Result<FlushReport> {
    let now = now_ms();
    let resyncs = manager.run_maintenance(now)?;
    if resyncs > 0 {
        log::info!("Requested resync for {} group(s)", resyncs);
    }
    manager.flush_outbox_at(now)
}
