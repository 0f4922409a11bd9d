//! Error types shared across the orchestration core.
//!
//! [`PipelineError`] is the failure taxonomy of a single stage or of the
//! recovery pass. Its `Display` output is what ends up (length-bounded) in
//! the `error` field of a job record, so messages are written for the person
//! looking at the job list rather than for a log parser.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::{JobId, JobStatus, PipelineKind};

/// Upper bound on error text persisted on a job record.
pub const MAX_ERROR_CHARS: usize = 4000;

/// Upper bound on the stderr excerpt kept from a failed tool.
pub const STDERR_TAIL_BYTES: usize = 4096;

/// Errors produced by a [`JobStore`](crate::store::JobStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A column held a value the model cannot represent.
    #[error("corrupt job row {id}: {message}")]
    Corrupt { id: String, message: String },
}

/// Errors produced while loading the pipeline registry.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read pipeline file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pipeline file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("pipeline '{kind}' is invalid: {message}")]
    Invalid { kind: String, message: String },
}

/// Failure of one stage invocation, or of the orchestration around it.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The external tool could not be started at all.
    #[error("{stage}: failed to launch '{program}': {source}")]
    ToolLaunch {
        stage: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Nonzero exit with nothing salvageable.
    #[error("{stage} failed (exit code {}){}", fmt_exit(*exit_code), fmt_tail(stderr_tail))]
    ToolExecution {
        stage: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("{stage} exceeded its time limit of {}s", timeout.as_secs())]
    ToolTimeout { stage: String, timeout: Duration },

    /// Exit 0 without a reported or default artifact.
    #[error("{stage} exited cleanly but produced no artifact")]
    ArtifactMissing { stage: String },

    /// Cooperative stop did not finish inside the grace window.
    #[error("Cancelled by user (force kill after {}s grace window)", grace.as_secs())]
    CancellationTimeout { grace: Duration },

    /// Forced stop left nothing usable behind.
    #[error("Stopped early: {stage} had not written any usable output yet")]
    Stopped { stage: String },

    #[error("Server was restarted while the job was running. It is safe to restart the job.")]
    OrphanRecovery,

    #[error("stage template for {stage} is invalid: {message}")]
    Template { stage: String, message: String },

    #[error("no pipeline definition for '{0}'")]
    NotConfigured(PipelineKind),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rejected lifecycle operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {0} is already running")]
    AlreadyRunning(JobId),

    #[error("cannot {action} job {id} while it is {status}")]
    InvalidState {
        id: JobId,
        status: JobStatus,
        action: &'static str,
    },

    #[error("no pipeline definition for '{0}'")]
    UnknownPipeline(PipelineKind),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_owned(),
    }
}

fn fmt_tail(tail: &str) -> String {
    let tail = tail.trim();
    if tail.is_empty() {
        String::new()
    } else {
        format!(":\n{tail}")
    }
}

/// Truncate `text` to at most `max` characters, respecting char boundaries.
pub fn bounded(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_owned(),
        None => text.to_owned(),
    }
}

/// Keep only the last `max` bytes of `bytes`, decoded lossily.
pub fn tail_lossy(bytes: &[u8], max: usize) -> String {
    let start = bytes.len().saturating_sub(max);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_keeps_short_text() {
        assert_eq!(bounded("short", 10), "short");
    }

    #[test]
    fn bounded_cuts_on_char_boundary() {
        let s = "äöü".repeat(3);
        assert_eq!(bounded(&s, 4), "äöüä");
    }

    #[test]
    fn tail_keeps_last_bytes() {
        assert_eq!(tail_lossy(b"abcdef", 3), "def");
        assert_eq!(tail_lossy(b"ab", 3), "ab");
    }

    #[test]
    fn execution_error_includes_tail() {
        let err = PipelineError::ToolExecution {
            stage: "lift".into(),
            exit_code: Some(3),
            stderr_tail: "boom\n".into(),
        };
        assert_eq!(err.to_string(), "lift failed (exit code 3):\nboom");
    }

    #[test]
    fn execution_error_without_tail_or_code() {
        let err = PipelineError::ToolExecution {
            stage: "detect".into(),
            exit_code: None,
            stderr_tail: "  ".into(),
        };
        assert_eq!(err.to_string(), "detect failed (exit code signal)");
    }
}
