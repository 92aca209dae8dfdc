//! The stderr protocol every state executable speaks.
//!
//! Stderr is split on `\n` and the first three pieces, each trimmed, are:
//! 1. the next state (`stop` ends the run)
//! 2. seconds to wait before the next state may run (≤ 0 or unparsable means now)
//! 3. a human-readable status message
//!
//! Anything after the third piece is ignored. Output ending right after the
//! delay line (`"stop\n0\n"`) still has three pieces and yields an empty status.

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

/// What a state asked for once it finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDirective {
    pub next_state: String,
    /// `None` when the next state is eligible immediately.
    pub delay_secs: Option<i64>,
    pub status_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected at least 3 newline-separated pieces on stderr, got {lines}")]
pub struct ProtocolViolation {
    pub lines: usize,
}

impl StepDirective {
    /// When the next state becomes eligible, relative to `now`.
    pub fn next_run_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let secs = self.delay_secs?;
        let at = TimeDelta::try_seconds(secs)
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Some(at)
    }
}

/// Parse a state's stderr into a directive.
pub fn parse_diagnostics(stderr: &str) -> Result<StepDirective, ProtocolViolation> {
    let lines: Vec<&str> = stderr.split('\n').take(3).collect();
    let [next_state, delay, status_message] = lines[..] else {
        return Err(ProtocolViolation { lines: lines.len() });
    };

    Ok(StepDirective {
        next_state: next_state.trim().to_string(),
        delay_secs: parse_delay(delay),
        status_message: status_message.trim().to_string(),
    })
}

/// Positive whole seconds, or `None` for "run immediately".
pub fn parse_delay(line: &str) -> Option<i64> {
    line.trim().parse::<i64>().ok().filter(|secs| *secs > 0)
}
