use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::engine::error::SchedulerError;
use crate::engine::executor;
use crate::engine::registry::ActiveRuns;
use crate::engine::types::{Run, RunId};
use crate::storage::{JobStore, StepCommit};

/// Status message written when a run is cancelled through the API.
pub const CANCELLED_MESSAGE: &str = "State machine run cancelled manually";

/// Schedules, advances, cancels and recovers state machine runs.
///
/// Every durable change goes to the store first; the in-memory registry is
/// updated only after the store accepted it. Cloning is cheap and every
/// clone shares the same store and registry.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    active: Arc<ActiveRuns>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            active: Arc::new(ActiveRuns::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn active(&self) -> &ActiveRuns {
        &self.active
    }

    /// Rebuild the registry from the store's active index.
    ///
    /// In-flight flags found on disk belong to executions that died with the
    /// previous process, so they are cleared and the runs become eligible again.
    /// Any error here means the active set cannot be trusted; callers treat it as fatal.
    pub async fn recover(&self) -> Result<usize, SchedulerError> {
        let runs = self.store.load_active().await?;
        let count = runs.len();
        for mut run in runs {
            if run.running {
                debug!(run_id = run.id, state = %run.next_state, "Clearing stale in-flight flag");
                run.running = false;
            }
            self.active.upsert(run);
        }
        info!(runs = count, "Recovered active runs");
        Ok(count)
    }

    /// Persist a fresh run at `start` and make it eligible immediately.
    pub async fn schedule(
        &self,
        machine: &str,
        path: impl AsRef<Path>,
        input: Vec<u8>,
    ) -> Result<RunId, SchedulerError> {
        let run = self.store.create_run(&Run::new(machine, path, input)).await?;
        let id = run.id;
        self.active.upsert(run);
        info!(run_id = id, machine = %machine, "Scheduled run");
        Ok(id)
    }

    /// Schedule a run of a catalog machine by name.
    pub async fn schedule_machine(
        &self,
        catalog: &Catalog,
        name: &str,
        input: Vec<u8>,
    ) -> Result<RunId, SchedulerError> {
        let machine = catalog
            .get(name)
            .ok_or_else(|| SchedulerError::MachineNotFound(name.to_string()))?;
        self.schedule(&machine.name, &machine.path, input).await
    }

    /// Read a run record from the store, including finished and cancelled runs.
    pub async fn get_run(&self, id: RunId) -> Result<Run, SchedulerError> {
        Ok(self.store.get_run(id).await?)
    }

    pub fn list_active(&self) -> Vec<Run> {
        self.active.snapshot()
    }

    /// Stop scheduling a run and persist it as stopped.
    ///
    /// The registry entry goes first so no later tick can pick the run up. A step
    /// already in flight is not interrupted; its result will be discarded as stale
    /// because cancellation bumps the record's generation.
    pub async fn cancel(&self, id: RunId) -> Result<Run, SchedulerError> {
        let removed = self
            .active
            .remove(id)
            .ok_or(SchedulerError::RunNotActive(id))?;

        match self.store.cancel_run(id, CANCELLED_MESSAGE).await {
            Ok(Some(run)) => {
                info!(run_id = id, "Cancelled run");
                Ok(run)
            }
            Ok(None) => {
                warn!(run_id = id, "Run was in the registry but not in the active index");
                Err(SchedulerError::RunNotActive(id))
            }
            Err(e) => {
                // Put it back so registry and active index keep agreeing.
                self.reinstate(removed).await;
                Err(e.into())
            }
        }
    }

    /// Return a run to the registry after a failed cancellation.
    ///
    /// A step that settled while the entry was out of the registry had its
    /// refresh dropped, so the copy taken at removal may still claim to be in
    /// flight. Once the entry is back, later refreshes land normally; the
    /// store is read afterwards to catch anything that settled in between.
    async fn reinstate(&self, removed: Run) {
        let id = removed.id;
        self.active.upsert(removed);
        match self.store.get_run(id).await {
            Ok(current) if current.is_stopped() => {
                debug!(run_id = id, "Run reached stop during failed cancellation");
                self.active.remove(id);
            }
            Ok(current) => {
                if self.active.refresh_if_newer(current) {
                    debug!(run_id = id, "Reinstated run from its persisted record");
                }
            }
            Err(e) => {
                warn!(run_id = id, error = %e, "Failed to reload run after failed cancellation");
            }
        }
    }

    /// Claim every eligible run and persist its in-flight flag. Returns the
    /// runs that are now dispatched and must be handed to [`Scheduler::run_step`].
    pub async fn dispatch_eligible(&self, now: DateTime<Utc>) -> Vec<Run> {
        let claimed = self.active.claim_eligible(now);
        let mut dispatched = Vec::with_capacity(claimed.len());

        for run in claimed {
            match self.store.begin_step(run.id).await {
                Ok(Some(run)) => {
                    self.active.refresh(run.clone());
                    dispatched.push(run);
                }
                Ok(None) => {
                    warn!(run_id = run.id, "Run missing from active index, dropping it");
                    self.active.remove(run.id);
                }
                Err(e) => {
                    error!(run_id = run.id, error = %e, "Failed to persist in-flight flag");
                    self.active.release(run.id);
                }
            }
        }

        dispatched
    }

    /// One dispatch pass that launches each step on its own task.
    /// Returns the launched tasks.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        self.dispatch_eligible(now)
            .await
            .into_iter()
            .map(|run| {
                let scheduler = self.clone();
                tokio::spawn(async move { scheduler.run_step(run).await })
            })
            .collect()
    }

    /// Execute the next state of a dispatched run and apply the result.
    pub async fn run_step(&self, run: Run) {
        let dispatched_generation = run.generation;
        let outcome = executor::execute_step(&run).await;

        let mut result = run;
        executor::apply_outcome(&mut result, outcome, Utc::now());
        self.apply_result(result, dispatched_generation).await;
    }

    async fn apply_result(&self, result: Run, dispatched_generation: u64) {
        let id = result.id;
        match self.store.complete_step(&result, dispatched_generation).await {
            Ok(StepCommit::Applied(run)) => {
                self.active.refresh(run);
            }
            Ok(StepCommit::Finished(run)) => {
                self.active.remove(id);
                info!(run_id = id, status = %run.status_message, "Run reached stop");
            }
            Ok(StepCommit::Stale {
                persisted_generation,
            }) => {
                // Cancellation (or another lifecycle write) won the race against this step.
                warn!(
                    run_id = id,
                    dispatched_generation,
                    persisted_generation,
                    "Discarding stale step result"
                );
                self.active.release(id);
            }
            Err(e) => {
                // Store still holds the pre-step record; the step runs again next tick.
                error!(run_id = id, error = %e, "Failed to persist step result");
                self.active.release(id);
            }
        }
    }
}
