use mocap_core::{JobRecord, JobView, StopAck};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateJobRequest {
    /// Media file the first stage reads.
    pub input_path: String,
    /// Pipeline kind, e.g. `"mediapipe"` or `"v4"`.
    pub pipeline: String,
    /// Display name; defaults to the input's file name.
    pub name: Option<String>,
    /// Source frame rate; probed from the input when omitted.
    pub fps: Option<f64>,
    /// Start the job right away instead of leaving it pending.
    #[serde(default)]
    pub start: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobResponse {
    pub id: String,
    pub name: String,
    pub input_path: String,
    pub pipeline: String,
    pub status: String,
    pub progress: u8,
    pub progress_detail: String,
    pub error: String,
    pub error_summary: String,
    pub artifact_path: String,
    pub intermediate_path: String,
    pub fps: f64,
    pub run: i64,
    /// A run for this job is active in this server process.
    pub running: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl JobResponse {
    pub fn from_record(job: &JobRecord, running: bool) -> Self {
        Self {
            id: job.id.to_string(),
            name: job.name.clone(),
            input_path: job.input_path.clone(),
            pipeline: job.pipeline_kind.to_string(),
            status: job.status.to_string(),
            progress: job.progress,
            progress_detail: job.progress_detail.clone(),
            error: job.error.clone(),
            error_summary: job.error_summary(),
            artifact_path: job.artifact_path.clone(),
            intermediate_path: job.intermediate_path.clone(),
            fps: job.fps,
            run: job.run,
            running,
            created_at: job.created_at.to_rfc3339(),
            updated_at: job.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobStatusResponse {
    pub status: String,
    pub progress: u8,
    pub progress_detail: String,
    pub error: String,
    pub error_summary: String,
    pub artifact_path: String,
}

impl From<JobView> for JobStatusResponse {
    fn from(view: JobView) -> Self {
        Self {
            status: view.status.to_string(),
            progress: view.progress,
            progress_detail: view.progress_detail,
            error: view.error,
            error_summary: view.error_summary,
            artifact_path: view.artifact_path,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StopResponse {
    pub id: String,
    /// `already_finished`, `cancelled` or `requested`.
    pub result: String,
}

impl StopResponse {
    pub fn new(id: impl ToString, ack: StopAck) -> Self {
        let result = match ack {
            StopAck::AlreadyFinished => "already_finished",
            StopAck::Cancelled => "cancelled",
            StopAck::Requested => "requested",
        };
        Self {
            id: id.to_string(),
            result: result.to_owned(),
        }
    }
}
