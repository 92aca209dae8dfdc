use std::io;
use std::path::Path;
use std::process::{ExitStatus, Output, Stdio};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::engine::protocol::{StepDirective, parse_diagnostics};
use crate::engine::types::Run;

/// Why a step attempt did not produce a directive. The run keeps its next
/// state and the same step is retried on the next tick, without limit.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("error executing state code at {path} (will keep retrying): {source}")]
    Launch {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("state code at {path} failed with {status} (will keep retrying)")]
    Exit { path: String, status: ExitStatus },

    #[error(
        "state code at {path} didn't return at least 3 lines correctly at stderr (will keep retrying), stderr was: {stderr}"
    )]
    Protocol { path: String, stderr: String },
}

/// Result of running one state executable.
#[derive(Debug)]
pub enum StepOutcome {
    Completed {
        directive: StepDirective,
        /// Everything the state wrote to stdout; becomes the next input.
        output: Vec<u8>,
    },
    Failed(StepError),
}

/// Run the executable for `run.next_state`, feeding it `run.input`.
pub async fn execute_step(run: &Run) -> StepOutcome {
    let step_path = run.step_path();
    let path = step_path.display().to_string();

    let output = match invoke(&step_path, &run.input).await {
        Ok(output) => output,
        Err(source) => return StepOutcome::Failed(StepError::Launch { path, source }),
    };

    if !output.status.success() {
        return StepOutcome::Failed(StepError::Exit {
            path,
            status: output.status,
        });
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    match parse_diagnostics(&stderr) {
        Ok(directive) => StepOutcome::Completed {
            directive,
            output: output.stdout,
        },
        Err(_) => StepOutcome::Failed(StepError::Protocol {
            path,
            stderr: stderr.into_owned(),
        }),
    }
}

/// Fold a step outcome into the run record. Always clears the in-flight flag.
pub fn apply_outcome(run: &mut Run, outcome: StepOutcome, now: DateTime<Utc>) {
    match outcome {
        StepOutcome::Completed { directive, output } => {
            let next_run_at = directive.next_run_at(now);
            let finished_state = std::mem::replace(&mut run.next_state, directive.next_state);
            info!(
                run_id = run.id,
                state = %finished_state,
                next_state = %run.next_state,
                "State completed"
            );
            run.last_state = Some(finished_state);
            run.next_run_at = next_run_at;
            run.input = output;
            run.status_message = directive.status_message;
        }
        StepOutcome::Failed(err) => {
            warn!(run_id = run.id, state = %run.next_state, error = %err, "State failed");
            run.status_message = err.to_string();
        }
    }
    run.running = false;
    run.updated = now;
}

/// Spawn the executable with no arguments, write `input` to its stdin and
/// collect stdout/stderr until it exits.
async fn invoke(path: &Path, input: &[u8]) -> io::Result<Output> {
    let mut child = Command::new(path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdin = child.stdin.take();
    let feed = async move {
        if let Some(mut stdin) = stdin
            && let Err(e) = stdin.write_all(input).await
            && e.kind() != io::ErrorKind::BrokenPipe
        {
            return Err(e);
        }
        Ok(())
    };

    // Feed stdin while draining both pipes so neither side blocks on a full buffer.
    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    let output = output?;
    fed?;
    Ok(output)
}
