//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use mocap_core::JobService;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Job lifecycle entry point.
    pub jobs: Arc<JobService>,
}
