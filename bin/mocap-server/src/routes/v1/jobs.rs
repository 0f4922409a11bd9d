//! Job lifecycle endpoints.
//!
//! Starting, stopping and restarting return as soon as the request has been
//! acted on; clients poll `GET /v1/jobs/{id}/status` for progress.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use mocap_core::{JobId, NewJob, PipelineKind};
use tracing::info;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::v1::job::{CreateJobRequest, JobResponse, JobStatusResponse, StopResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(
        create_job,
        list_jobs,
        get_job,
        get_job_status,
        start_job,
        stop_job,
        restart_job,
        delete_job
    ),
    components(schemas(CreateJobRequest, JobResponse, JobStatusResponse, StopResponse))
)]
pub struct JobsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/{id}", get(get_job).delete(delete_job))
        .route("/jobs/{id}/status", get(get_job_status))
        .route("/jobs/{id}/start", post(start_job))
        .route("/jobs/{id}/stop", post(stop_job))
        .route("/jobs/{id}/restart", post(restart_job))
}

async fn respond(state: &AppState, id: JobId) -> Result<Json<JobResponse>, ServerError> {
    let job = state.jobs.get(id).await?;
    Ok(Json(JobResponse::from_record(&job, state.jobs.is_running(id))))
}

#[utoipa::path(
    post,
    path = "/v1/jobs",
    tag = "jobs",
    request_body = CreateJobRequest,
    responses(
        (status = 201, description = "Job created", body = JobResponse),
        (status = 400, description = "Unknown pipeline or missing input"),
        (status = 500, description = "Store error"),
    )
)]
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<JobResponse>), ServerError> {
    if req.input_path.trim().is_empty() {
        return Err(ServerError::BadRequest("input_path must not be empty".into()));
    }
    let pipeline_kind = req
        .pipeline
        .parse::<PipelineKind>()
        .map_err(|_| ServerError::BadRequest(format!("unknown pipeline '{}'", req.pipeline)))?;
    let name = req.name.unwrap_or_else(|| {
        std::path::Path::new(&req.input_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| req.input_path.clone())
    });

    let job = state
        .jobs
        .submit(NewJob {
            name,
            input_path: req.input_path,
            pipeline_kind,
            fps: req.fps,
        })
        .await?;
    if req.start {
        state.jobs.start(job.id).await?;
        info!(job_id = %job.id, "job started on submission");
    }

    let Json(body) = respond(&state, job.id).await?;
    Ok((StatusCode::CREATED, Json(body)))
}

#[utoipa::path(
    get,
    path = "/v1/jobs",
    tag = "jobs",
    responses(
        (status = 200, description = "Jobs listed, newest first", body = [JobResponse]),
        (status = 500, description = "Store error"),
    )
)]
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<JobResponse>>, ServerError> {
    let jobs = state.jobs.list().await?;
    Ok(Json(
        jobs.iter()
            .map(|j| JobResponse::from_record(j, state.jobs.is_running(j.id)))
            .collect(),
    ))
}

#[utoipa::path(
    get,
    path = "/v1/jobs/{id}",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job retrieved", body = JobResponse),
        (status = 404, description = "Job not found"),
    )
)]
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
) -> Result<Json<JobResponse>, ServerError> {
    respond(&state, id).await
}

#[utoipa::path(
    get,
    path = "/v1/jobs/{id}/status",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Current status", body = JobStatusResponse),
        (status = 404, description = "Job not found"),
    )
)]
pub async fn get_job_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
) -> Result<Json<JobStatusResponse>, ServerError> {
    Ok(Json(state.jobs.status(id).await?.into()))
}

#[utoipa::path(
    post,
    path = "/v1/jobs/{id}/start",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 202, description = "Job started", body = JobResponse),
        (status = 404, description = "Job not found"),
        (status = 409, description = "Job is running or not pending"),
    )
)]
pub async fn start_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
) -> Result<(StatusCode, Json<JobResponse>), ServerError> {
    state.jobs.start(id).await?;
    Ok((StatusCode::ACCEPTED, respond(&state, id).await?))
}

#[utoipa::path(
    post,
    path = "/v1/jobs/{id}/stop",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Stop acknowledged", body = StopResponse),
        (status = 404, description = "Job not found"),
    )
)]
pub async fn stop_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
) -> Result<Json<StopResponse>, ServerError> {
    let ack = state.jobs.stop(id).await?;
    Ok(Json(StopResponse::new(id, ack)))
}

#[utoipa::path(
    post,
    path = "/v1/jobs/{id}/restart",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 202, description = "Job restarted", body = JobResponse),
        (status = 404, description = "Job not found"),
        (status = 409, description = "Job is running or not finished"),
    )
)]
pub async fn restart_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
) -> Result<(StatusCode, Json<JobResponse>), ServerError> {
    state.jobs.restart(id).await?;
    Ok((StatusCode::ACCEPTED, respond(&state, id).await?))
}

#[utoipa::path(
    delete,
    path = "/v1/jobs/{id}",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 204, description = "Job deleted"),
        (status = 404, description = "Job not found"),
    )
)]
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
) -> Result<StatusCode, ServerError> {
    state.jobs.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
