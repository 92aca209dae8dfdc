use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::engine::types::{Run, RunId};
use crate::storage::{JobStore, StepCommit, StoreError, cancelled, dispatched, settled};

/// In-process job store. Records are kept serialized, exactly as the SQLite
/// store keeps them, but nothing survives the store instance.
pub struct MemoryJobStore {
    inner: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    sequence: RunId,
    runs: BTreeMap<RunId, String>,
    active: BTreeSet<RunId>,
}

impl Tables {
    fn read(&self, id: RunId) -> Result<Run, StoreError> {
        let record = self.runs.get(&id).ok_or(StoreError::NotFound(id))?;
        Ok(serde_json::from_str(record)?)
    }

    fn write(&mut self, run: &Run) -> Result<(), StoreError> {
        let record = serde_json::to_string(run)?;
        self.runs.insert(run.id, record);
        Ok(())
    }

    fn next_id(&mut self) -> RunId {
        self.sequence += 1;
        self.sequence
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Tables::default()),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn allocate_id(&self) -> Result<RunId, StoreError> {
        Ok(self.tables().next_id())
    }

    async fn put_run(&self, run: &Run) -> Result<(), StoreError> {
        self.tables().write(run)
    }

    async fn get_run(&self, id: RunId) -> Result<Run, StoreError> {
        self.tables().read(id)
    }

    async fn mark_active(&self, id: RunId) -> Result<(), StoreError> {
        self.tables().active.insert(id);
        Ok(())
    }

    async fn mark_inactive(&self, id: RunId) -> Result<(), StoreError> {
        self.tables().active.remove(&id);
        Ok(())
    }

    async fn active_ids(&self) -> Result<Vec<RunId>, StoreError> {
        Ok(self.tables().active.iter().copied().collect())
    }

    async fn create_run(&self, run: &Run) -> Result<Run, StoreError> {
        let mut tables = self.tables();
        let mut run = run.clone();
        // Serialize before touching the sequence so a failure leaves nothing behind.
        serde_json::to_string(&run)?;
        run.id = tables.next_id();
        tables.write(&run)?;
        tables.active.insert(run.id);
        Ok(run)
    }

    async fn load_active(&self) -> Result<Vec<Run>, StoreError> {
        let tables = self.tables();
        tables
            .active
            .iter()
            .map(|id| {
                tables.read(*id).map_err(|e| match e {
                    StoreError::NotFound(id) => {
                        StoreError::Corrupt(format!("active run {} has no record", id))
                    }
                    other => other,
                })
            })
            .collect()
    }

    async fn begin_step(&self, id: RunId) -> Result<Option<Run>, StoreError> {
        let mut tables = self.tables();
        if !tables.active.contains(&id) {
            return Ok(None);
        }
        let run = dispatched(tables.read(id)?);
        tables.write(&run)?;
        Ok(Some(run))
    }

    async fn complete_step(
        &self,
        run: &Run,
        dispatched_generation: u64,
    ) -> Result<StepCommit, StoreError> {
        let mut tables = self.tables();
        let persisted = tables.read(run.id)?;
        if persisted.generation != dispatched_generation || !tables.active.contains(&run.id) {
            return Ok(StepCommit::Stale {
                persisted_generation: persisted.generation,
            });
        }

        let settled = settled(&persisted, run);
        tables.write(&settled)?;
        if settled.is_stopped() {
            tables.active.remove(&settled.id);
            Ok(StepCommit::Finished(settled))
        } else {
            Ok(StepCommit::Applied(settled))
        }
    }

    async fn cancel_run(&self, id: RunId, message: &str) -> Result<Option<Run>, StoreError> {
        let mut tables = self.tables();
        if !tables.active.contains(&id) {
            return Ok(None);
        }
        let persisted = tables.read(id)?;
        let terminal = if persisted.is_stopped() {
            persisted
        } else {
            let run = cancelled(persisted, message);
            tables.write(&run)?;
            run
        };
        tables.active.remove(&id);
        Ok(Some(terminal))
    }
}
