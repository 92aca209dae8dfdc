use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::engine::scheduler::Scheduler;

/// How often the dispatcher scans for eligible runs.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Background task driving [`Scheduler::dispatch_eligible`] on a fixed period.
///
/// Every launched step lives in a `JoinSet` owned by the dispatch loop.
/// Shutting down stops the timer, then waits for the steps already in
/// flight so their results are persisted before the runtime goes away.
pub struct Dispatcher {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl Dispatcher {
    pub fn start(scheduler: Scheduler, period: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut steps = JoinSet::new();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        while let Some(result) = steps.try_join_next() {
                            log_step_failure(result);
                        }

                        let runs = scheduler.dispatch_eligible(Utc::now()).await;
                        if !runs.is_empty() {
                            debug!(steps = runs.len(), "Dispatched steps");
                        }
                        for run in runs {
                            let scheduler = scheduler.clone();
                            steps.spawn(async move { scheduler.run_step(run).await });
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!(in_flight = steps.len(), "Dispatcher shutting down");
                        break;
                    }
                }
            }

            while let Some(result) = steps.join_next().await {
                log_step_failure(result);
            }
            debug!("In-flight steps drained");
        });

        info!(period_ms = period.as_millis() as u64, "Dispatcher started");
        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Stop ticking, then wait for the steps in flight and the dispatch loop to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            error!(error = %e, "Dispatcher task failed");
        }
    }
}

fn log_step_failure(result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "Step task panicked");
    }
}
