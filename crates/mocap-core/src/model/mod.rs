//! Job data model.

mod job;

pub use job::{error_summary, JobId, JobRecord, JobStatus, JobView, PipelineKind, DEFAULT_FPS};
