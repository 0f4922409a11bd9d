//! Server configuration, loaded from environment variables at startup.

use std::path::PathBuf;

use mocap_core::RuntimeConfig;

/// Runtime configuration for mocap-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:8000"`).
    pub bind_address: String,

    /// SQLite database URL (default: `"sqlite://mocap.db?mode=rwc"`).
    pub database_url: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Directory for daily rolling log files. Console only when unset.
    pub log_dir: Option<PathBuf>,

    /// Comma-separated list of allowed CORS origins. Any origin when unset.
    pub cors_allowed_origins: Option<String>,

    /// Supervision settings handed to the orchestration core.
    pub runtime: RuntimeConfig,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("MOCAP_BIND", "0.0.0.0:8000"),
            database_url: env_or("MOCAP_DATABASE_URL", "sqlite://mocap.db?mode=rwc"),
            log_level: env_or("MOCAP_LOG", "info"),
            log_json: std::env::var("MOCAP_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            log_dir: non_empty("MOCAP_LOG_DIR").map(PathBuf::from),
            cors_allowed_origins: non_empty("MOCAP_CORS_ORIGINS"),
            runtime: RuntimeConfig::from_env(),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
