//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors are automatically converted
//! to a JSON-body HTTP response with an appropriate status code.
//!
//! Internal errors (store, I/O) are logged with full detail but only a
//! generic message is returned, so file paths and SQL never reach clients.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use mocap_core::ServiceError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// A lifecycle operation was rejected or failed in the core.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = match &self {
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::Service(e) => match e {
                ServiceError::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
                ServiceError::AlreadyRunning(_) | ServiceError::InvalidState { .. } => {
                    (StatusCode::CONFLICT, e.to_string())
                }
                ServiceError::UnknownPipeline(_) => (StatusCode::BAD_REQUEST, e.to_string()),
                ServiceError::Store(_) | ServiceError::Io(_) => {
                    error!(error = %e, "job service error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal server error".to_owned(),
                    )
                }
            },
        };
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mocap_core::JobStatus;
    use uuid::Uuid;

    fn status_of(err: ServerError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn service_errors_map_to_http_status() {
        let id = Uuid::new_v4();
        assert_eq!(status_of(ServiceError::NotFound(id).into()), StatusCode::NOT_FOUND);
        assert_eq!(status_of(ServiceError::AlreadyRunning(id).into()), StatusCode::CONFLICT);
        assert_eq!(
            status_of(
                ServiceError::InvalidState {
                    id,
                    status: JobStatus::Pending,
                    action: "restart",
                }
                .into()
            ),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(ServiceError::Io(std::io::Error::other("disk")).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn internal_failures_hide_detail() {
        use http_body_util::BodyExt;

        let err: ServerError = ServiceError::Io(std::io::Error::other("/srv/media/secret")).into();
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "internal server error");
    }

    #[test]
    fn bad_request_is_400() {
        assert_eq!(status_of(ServerError::BadRequest("nope".into())), StatusCode::BAD_REQUEST);
    }
}
