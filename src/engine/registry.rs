use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::engine::types::{Run, RunId};

/// In-memory mirror of the active runs, keyed by run id.
///
/// The lock is only ever taken for bookkeeping and is never held across an
/// `.await`, so callers get copies rather than references into the map.
#[derive(Default)]
pub struct ActiveRuns {
    runs: Mutex<BTreeMap<RunId, Run>>,
}

impl ActiveRuns {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<RunId, Run>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of every active run, ordered by id.
    pub fn snapshot(&self) -> Vec<Run> {
        self.lock().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<RunId> {
        self.lock().keys().copied().collect()
    }

    pub fn get(&self, id: RunId) -> Option<Run> {
        self.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: RunId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn upsert(&self, run: Run) {
        self.lock().insert(run.id, run);
    }

    pub fn remove(&self, id: RunId) -> Option<Run> {
        self.lock().remove(&id)
    }

    /// Replace the entry for `run.id` only if it is still present.
    /// A run removed concurrently (cancelled, finished) is not revived.
    pub fn refresh(&self, run: Run) -> bool {
        match self.lock().get_mut(&run.id) {
            Some(entry) => {
                *entry = run;
                true
            }
            None => false,
        }
    }

    /// Replace the entry for `run.id` only if it is present and `run` carries
    /// a later generation than the entry.
    pub fn refresh_if_newer(&self, run: Run) -> bool {
        match self.lock().get_mut(&run.id) {
            Some(entry) if run.generation > entry.generation => {
                *entry = run;
                true
            }
            _ => false,
        }
    }

    /// Clear the in-flight flag of a run, if present.
    pub fn release(&self, id: RunId) {
        if let Some(run) = self.lock().get_mut(&id) {
            run.running = false;
        }
    }

    /// Flag every eligible run as in flight and return copies of them.
    pub fn claim_eligible(&self, now: DateTime<Utc>) -> Vec<Run> {
        let mut runs = self.lock();
        runs.values_mut()
            .filter(|run| run.is_eligible(now))
            .map(|run| {
                run.running = true;
                run.clone()
            })
            .collect()
    }
}
