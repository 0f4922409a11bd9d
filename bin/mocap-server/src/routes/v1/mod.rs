pub mod jobs;

use std::sync::Arc;

use axum::Router;
use utoipa::OpenApi;

use crate::state::AppState;

/// Routes nested under `/v1`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().merge(jobs::router())
}

pub fn api_docs() -> utoipa::openapi::OpenApi {
    jobs::JobsApi::openapi()
}
