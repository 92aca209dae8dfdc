pub mod memory_store;
pub mod sqlite_store;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::engine::types::{Run, RunId, STOP_STATE};

/// Failures raised by a [`JobStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run {0} not found")]
    NotFound(RunId),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to (de)serialize run record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt store: {0}")]
    Corrupt(String),
}

/// What happened when a step result was offered to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepCommit {
    /// Result persisted; the run is still active.
    Applied(Run),
    /// Result persisted and the run reached `stop`; it was removed from the active index.
    Finished(Run),
    /// The record changed since dispatch (e.g. cancelled); the result was discarded.
    Stale { persisted_generation: u64 },
}

/// Durable persistence for runs: a run-record table, an active-run index and an id sequence.
///
/// Composite operations (`create_run`, `begin_step`, `complete_step`, `cancel_run`)
/// are atomic: either every write they perform lands, or none does.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Take the next value of the run-record sequence.
    async fn allocate_id(&self) -> Result<RunId, StoreError>;

    /// Insert or overwrite a run record. Does not touch the active index.
    async fn put_run(&self, run: &Run) -> Result<(), StoreError>;

    /// Read a run record, active or historical.
    async fn get_run(&self, id: RunId) -> Result<Run, StoreError>;

    async fn mark_active(&self, id: RunId) -> Result<(), StoreError>;

    async fn mark_inactive(&self, id: RunId) -> Result<(), StoreError>;

    /// Ids in the active index, ascending.
    async fn active_ids(&self) -> Result<Vec<RunId>, StoreError>;

    /// Allocate an id, write the record and mark it active in one unit.
    /// Returns the run with its assigned id.
    async fn create_run(&self, run: &Run) -> Result<Run, StoreError>;

    /// Load the record of every active run. A dangling index entry is an error.
    async fn load_active(&self) -> Result<Vec<Run>, StoreError>;

    /// Persist the in-flight flag for an active run and bump its generation.
    /// Returns `None` if the run is no longer active.
    async fn begin_step(&self, id: RunId) -> Result<Option<Run>, StoreError>;

    /// Persist a step result if the record's generation still equals `dispatched_generation`.
    /// When the result's next state is `stop` the run is also removed from the active index.
    async fn complete_step(
        &self,
        run: &Run,
        dispatched_generation: u64,
    ) -> Result<StepCommit, StoreError>;

    /// Write the terminal record for an active run and remove it from the active index.
    /// A record whose next state is already `stop` is left as-is.
    /// Returns `None` if the run is not in the active index.
    async fn cancel_run(&self, id: RunId, message: &str) -> Result<Option<Run>, StoreError>;
}

/// Key under which a run lives in both namespaces.
pub(crate) fn run_key(id: RunId) -> String {
    id.to_string()
}

pub(crate) fn parse_run_key(key: &str) -> Result<RunId, StoreError> {
    key.parse()
        .map_err(|_| StoreError::Corrupt(format!("invalid run key '{}'", key)))
}

/// Record as written by `begin_step`.
pub(crate) fn dispatched(mut run: Run) -> Run {
    run.running = true;
    run.generation += 1;
    run.updated = Utc::now();
    run
}

/// Record as written by `complete_step` on top of the persisted one.
pub(crate) fn settled(persisted: &Run, result: &Run) -> Run {
    let now = Utc::now();
    let mut run = result.clone();
    run.id = persisted.id;
    run.running = false;
    run.generation = persisted.generation + 1;
    run.updated = now;
    if run.is_stopped() {
        run.finished = Some(now);
    }
    run
}

/// Record as written by `cancel_run`.
pub(crate) fn cancelled(mut run: Run, message: &str) -> Run {
    let now = Utc::now();
    run.next_state = STOP_STATE.to_string();
    run.status_message = message.to_string();
    run.running = false;
    run.generation += 1;
    run.updated = now;
    run.finished = Some(now);
    run
}
