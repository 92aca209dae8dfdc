use thiserror::Error;

use crate::engine::types::RunId;
use crate::storage::StoreError;

/// Errors surfaced to callers of the [`Scheduler`](crate::engine::Scheduler).
///
/// Step failures never show up here: they are recorded in the run's status
/// message and retried on later ticks.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no state machine run with id {0} found")]
    RunNotFound(RunId),

    #[error("state machine run with id {0} is not currently active")]
    RunNotActive(RunId),

    #[error("state machine '{0}' not found")]
    MachineNotFound(String),

    #[error("persistence error: {0}")]
    Persistence(#[source] StoreError),
}

impl SchedulerError {
    /// Whether the error means "no such thing" rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SchedulerError::RunNotFound(_)
                | SchedulerError::RunNotActive(_)
                | SchedulerError::MachineNotFound(_)
        )
    }
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => SchedulerError::RunNotFound(id),
            other => SchedulerError::Persistence(other),
        }
    }
}
