use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned run identifier. Zero means "not yet persisted".
pub type RunId = u64;

/// Every run begins at this state.
pub const START_STATE: &str = "start";

/// Terminal state. A run whose next state is `stop` is no longer active.
pub const STOP_STATE: &str = "stop";

/// Coarse lifecycle phase of a run, derived from its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Waiting,
    Running,
    Stopped,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunPhase::Waiting => "waiting",
            RunPhase::Running => "running",
            RunPhase::Stopped => "stopped",
        };
        f.pad(name)
    }
}

/// One scheduled execution of a state machine, tracked from `start` to `stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    /// Name of the state machine this run was created from.
    pub machine: String,
    /// Root directory holding the machine's state executables.
    pub path: PathBuf,
    /// Payload fed to the next state on stdin.
    #[serde(with = "base64_bytes")]
    pub input: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_state: Option<String>,
    pub next_state: String,
    #[serde(default)]
    pub status_message: String,
    /// Set while a step execution is in flight.
    #[serde(default)]
    pub running: bool,
    /// Earliest time the next state may run. `None` means immediately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    /// Bumped by every lifecycle write (dispatch, step result, cancellation).
    #[serde(default)]
    pub generation: u64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(machine: &str, path: impl AsRef<Path>, input: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            machine: machine.to_string(),
            path: path.as_ref().to_path_buf(),
            input,
            last_state: None,
            next_state: START_STATE.to_string(),
            status_message: String::new(),
            running: false,
            next_run_at: None,
            generation: 0,
            created: now,
            updated: now,
            finished: None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.next_state == STOP_STATE
    }

    /// Whether the dispatcher may launch the next state at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        !self.running && !self.is_stopped() && self.next_run_at.is_none_or(|at| at <= now)
    }

    /// Path of the executable for the next state.
    pub fn step_path(&self) -> PathBuf {
        self.path.join(&self.next_state)
    }

    pub fn phase(&self) -> RunPhase {
        if self.is_stopped() {
            RunPhase::Stopped
        } else if self.running {
            RunPhase::Running
        } else {
            RunPhase::Waiting
        }
    }
}

/// Serializes the opaque input payload as standard base64 inside JSON records.
mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
