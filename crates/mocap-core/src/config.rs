//! Runtime configuration for the orchestration core, loaded from environment
//! variables.

use std::path::PathBuf;
use std::time::Duration;

/// Settings that shape how jobs are supervised.
///
/// Every field has a default so the core works without any environment
/// variables set.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root of all job working areas (`<media_root>/output/<job_id>`).
    pub media_root: PathBuf,

    /// Substituted for `{tools}` in stage templates.
    pub tools_root: PathBuf,

    /// Substituted for `{python}` in stage templates.
    pub python: String,

    /// Optional TOML file overriding built-in pipeline definitions.
    pub pipelines_file: Option<PathBuf>,

    /// Minimum spacing between progress writes for one job.
    pub progress_interval: Duration,

    /// How long a cooperative stop may take before the process is killed.
    pub cooperative_grace: Duration,

    /// How long to wait for a killed process to be reaped.
    pub kill_wait: Duration,

    /// Artifacts at or below this size are not considered usable.
    pub min_artifact_bytes: u64,

    /// Liveness poll interval for processes re-attached after a restart.
    pub monitor_poll: Duration,

    /// `ffprobe` binary used to read source frame rates.
    pub ffprobe: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            media_root: PathBuf::from("./media"),
            tools_root: PathBuf::from("./tools"),
            python: "python3".to_owned(),
            pipelines_file: None,
            progress_interval: Duration::from_millis(1000),
            cooperative_grace: Duration::from_secs(30),
            kill_wait: Duration::from_secs(5),
            min_artifact_bytes: 100,
            monitor_poll: Duration::from_millis(1000),
            ffprobe: "ffprobe".to_owned(),
        }
    }
}

impl RuntimeConfig {
    /// Build [`RuntimeConfig`] from `MOCAP_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            media_root: PathBuf::from(env_or("MOCAP_MEDIA_ROOT", "./media")),
            tools_root: PathBuf::from(env_or("MOCAP_TOOLS_ROOT", "./tools")),
            python: env_or("MOCAP_PYTHON", &defaults.python),
            pipelines_file: std::env::var("MOCAP_PIPELINES")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            progress_interval: Duration::from_millis(parse_env("MOCAP_PROGRESS_INTERVAL_MS", 1000)),
            cooperative_grace: Duration::from_secs(parse_env("MOCAP_COOPERATIVE_GRACE_SECS", 30)),
            kill_wait: Duration::from_secs(parse_env("MOCAP_KILL_WAIT_SECS", 5)),
            min_artifact_bytes: parse_env("MOCAP_MIN_ARTIFACT_BYTES", defaults.min_artifact_bytes),
            monitor_poll: Duration::from_millis(parse_env("MOCAP_MONITOR_POLL_MS", 1000)),
            ffprobe: env_or("MOCAP_FFPROBE", &defaults.ffprobe),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
