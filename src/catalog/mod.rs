use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context as _, Result, bail};
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::types::START_STATE;

/// A state machine found on disk: a directory whose executable files are its states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateMachine {
    pub name: String,
    pub path: PathBuf,
    /// Output of `start --help`.
    pub usage: String,
    pub states: Vec<String>,
}

/// Read-only list of state machines, loaded once at startup.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Catalog {
    machines: Vec<StateMachine>,
}

impl Catalog {
    pub fn new(mut machines: Vec<StateMachine>) -> Self {
        machines.sort_by(|a, b| a.name.cmp(&b.name));
        Self { machines }
    }

    /// Build the catalog from the subdirectories of `dir`.
    ///
    /// Fails if the directory can't be listed, if a machine has no `start`
    /// state, or if `start --help` can't be run.
    pub async fn scan(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("Failed to list state machine directory: {}", dir.display()))?;

        let mut machines = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if !metadata.is_dir() {
                continue;
            }
            machines.push(load_machine(&path).await?);
        }

        info!(machines = machines.len(), dir = %dir.display(), "Loaded state machines");
        Ok(Self::new(machines))
    }

    pub fn get(&self, name: &str) -> Option<&StateMachine> {
        self.machines.iter().find(|m| m.name == name)
    }

    pub fn machines(&self) -> &[StateMachine] {
        &self.machines
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}

async fn load_machine(path: &Path) -> Result<StateMachine> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid state machine path: {}", path.display()))?;

    let mut states = Vec::new();
    let mut entries = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("Failed to list directory of state machine '{}'", name))?;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if metadata.is_file() && is_executable(&metadata) {
            states.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    states.sort();

    if !states.iter().any(|s| s == START_STATE) {
        bail!("State machine directory for '{}' has no start state", name);
    }

    let usage = read_usage(path)
        .await
        .with_context(|| format!("Failed to get usage for state machine '{}'", name))?;

    Ok(StateMachine {
        name,
        path: path.to_path_buf(),
        usage,
        states,
    })
}

/// Output of `<machine>/start --help`, with stdout and stderr interleaved in
/// the order the process wrote them.
async fn read_usage(path: &Path) -> Result<String> {
    let start = path.join(START_STATE);
    tokio::task::spawn_blocking(move || combined_output(&start))
        .await
        .context("Usage task failed")?
}

/// Run `start --help` with both output streams pointed at one pipe.
fn combined_output(start: &Path) -> Result<String> {
    let (mut reader, writer) = std::io::pipe().context("Failed to create output pipe")?;

    // `command` owns our copies of the write end; dropping it at the end of
    // this block lets the read below finish when the child exits.
    let mut child = {
        let mut command = std::process::Command::new(start);
        command
            .arg("--help")
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer);
        command
            .spawn()
            .with_context(|| format!("Failed to execute '{} --help'", start.display()))?
    };

    let mut output = Vec::new();
    reader.read_to_end(&mut output)?;
    let status = child.wait()?;

    if !status.success() {
        bail!("'{} --help' exited with {}", start.display(), status);
    }

    Ok(String::from_utf8_lossy(&output).into_owned())
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}
