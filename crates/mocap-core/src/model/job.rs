use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

/// Unique identifier of a submitted job.
pub type JobId = Uuid;

/// Default source frame rate when nothing better is known.
pub const DEFAULT_FPS: f64 = 30.0;

/// Lifecycle state of a job.
///
/// `pending → {stage states in sequence} → complete`; any stage state may move
/// to `failed`; `complete`/`failed` return to `pending` only through restart.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    /// 2D keypoint detection.
    Detecting,
    /// Exchange-format conversion between detector and lifter.
    Converting,
    /// 3D lifting of 2D keypoints.
    Lifting,
    /// Single-stage video to motion tools.
    Processing,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }

    /// `true` for the per-stage states.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != JobStatus::Pending
    }

    /// Stage states a job can be left in when the service ends mid-run.
    /// Pending jobs never started and are not orphans.
    pub fn active() -> &'static [JobStatus] {
        &[
            JobStatus::Detecting,
            JobStatus::Converting,
            JobStatus::Lifting,
            JobStatus::Processing,
        ]
    }
}

/// Named configuration selecting the stage sequence and tool set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PipelineKind {
    // 2D detector followed by the MocapNET lifter.
    Mediapipe,
    Openpose,
    Rtmpose,
    Vitpose,
    Yolo11,
    // Complete video to motion tools.
    V4,
    Gvhmr,
    Wham,
    Prompthmr,
}

impl PipelineKind {
    /// Kinds that go through a separate 2D detection stage.
    pub fn is_two_dimensional(self) -> bool {
        matches!(
            self,
            PipelineKind::Mediapipe
                | PipelineKind::Openpose
                | PipelineKind::Rtmpose
                | PipelineKind::Vitpose
                | PipelineKind::Yolo11
        )
    }
}

/// One submitted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Display name, usually the uploaded file name.
    pub name: String,
    /// Media file consumed by the first stage.
    pub input_path: String,
    pub pipeline_kind: PipelineKind,
    pub status: JobStatus,
    /// 0-100, never decreasing within one run.
    pub progress: u8,
    pub progress_detail: String,
    /// Empty unless the job failed.
    pub error: String,
    /// Final artifact; empty until the last stage produced it.
    pub artifact_path: String,
    /// Output of the most recent finished non-final stage.
    pub intermediate_path: String,
    pub fps: f64,
    /// Incremented on every restart. Writes from an older run are ignored.
    pub run: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(
        name: impl Into<String>,
        input_path: impl Into<String>,
        pipeline_kind: PipelineKind,
        fps: Option<f64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            input_path: input_path.into(),
            pipeline_kind,
            status: JobStatus::Pending,
            progress: 0,
            progress_detail: String::new(),
            error: String::new(),
            artifact_path: String::new(),
            intermediate_path: String::new(),
            fps: fps.filter(|f| f.is_finite() && *f > 0.0).unwrap_or(DEFAULT_FPS),
            run: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// File stem of [`JobRecord::name`], used to name artifacts.
    pub fn stem(&self) -> &str {
        match self.name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => &self.name,
        }
    }

    /// Short one-line description of [`JobRecord::error`].
    ///
    /// Text before a traceback is kept as a prefix; inside a traceback the
    /// last `SomethingError: message` line is picked.
    pub fn error_summary(&self) -> String {
        error_summary(&self.error)
    }

    pub fn view(&self) -> JobView {
        JobView {
            status: self.status,
            progress: self.progress,
            progress_detail: self.progress_detail.clone(),
            error: self.error.clone(),
            error_summary: self.error_summary(),
            artifact_path: self.artifact_path.clone(),
        }
    }
}

/// Read-only status projection of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub status: JobStatus,
    pub progress: u8,
    pub progress_detail: String,
    pub error: String,
    pub error_summary: String,
    pub artifact_path: String,
}

pub fn error_summary(error: &str) -> String {
    if error.is_empty() {
        return String::new();
    }
    let Some((before, _)) = error.split_once("Traceback") else {
        return error.lines().next().unwrap_or_default().trim().to_owned();
    };

    let prefix = before.trim().trim_end_matches(':').trim();
    let error_line = error
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| l.contains("Error") && l.contains(':') && !l.starts_with("File "))
        .unwrap_or_default();

    match (prefix.is_empty(), error_line.is_empty()) {
        (false, false) => format!("{prefix}: {error_line}"),
        (true, false) => error_line.to_owned(),
        (false, true) => prefix.to_owned(),
        (true, true) => "Processing failed (traceback truncated)".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_round_trips_through_strings() {
        assert_eq!(JobStatus::Detecting.as_ref(), "detecting");
        assert_eq!(JobStatus::from_str("lifting").ok(), Some(JobStatus::Lifting));
        assert!(JobStatus::from_str("running").is_err());
    }

    #[test]
    fn terminal_and_active_statuses() {
        assert!(JobStatus::Complete.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_active());
        assert!(JobStatus::Processing.is_active());
        assert!(JobStatus::active().iter().all(|s| s.is_active()));
        assert!(!JobStatus::active().contains(&JobStatus::Pending));
    }

    #[test]
    fn pipeline_kind_parses_lowercase() {
        assert_eq!(PipelineKind::from_str("yolo11").ok(), Some(PipelineKind::Yolo11));
        assert_eq!(PipelineKind::Prompthmr.to_string(), "prompthmr");
        assert!(PipelineKind::Openpose.is_two_dimensional());
        assert!(!PipelineKind::Gvhmr.is_two_dimensional());
    }

    #[test]
    fn new_record_defaults() {
        let job = JobRecord::new("walk.mp4", "/media/walk.mp4", PipelineKind::V4, Some(f64::NAN));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.fps, DEFAULT_FPS);
        assert_eq!(job.stem(), "walk");
        assert_eq!(job.run, 0);
    }

    #[test]
    fn stem_without_extension() {
        let job = JobRecord::new(".hidden", "x", PipelineKind::V4, None);
        assert_eq!(job.stem(), ".hidden");
    }

    #[test]
    fn summary_of_plain_error_is_first_line() {
        assert_eq!(error_summary("lift failed\nmore detail"), "lift failed");
        assert_eq!(error_summary(""), "");
    }

    #[test]
    fn summary_of_traceback_uses_prefix_and_error_line() {
        let err = "detect failed:\nTraceback (most recent call last):\n  File \"x.py\", line 3\nValueError: bad frame\n";
        assert_eq!(error_summary(err), "detect failed: ValueError: bad frame");
    }

    #[test]
    fn summary_of_truncated_traceback() {
        assert_eq!(
            error_summary("Traceback (most recent call last):\n  File \"x.py\""),
            "Processing failed (traceback truncated)"
        );
    }
}
