//! Pipeline registry: maps a [`PipelineKind`] to its ordered stages.
//!
//! Built-in definitions live in [`defaults`]. A TOML file can replace the
//! definition of any kind:
//!
//! ```toml
//! [v4]
//! cancel_style = "cooperative"
//!
//! [[v4.stages]]
//! name = "v4"
//! status = "processing"
//! program = "{python}"
//! args = ["{tools}/MocapNET_v4/run_v4_pipeline.py", "--from", "{media}",
//!         "--output", "{work_dir}/v4_{stem}.bvh", "--stop-flag", "{stop_flag}"]
//! timeout_secs = 1800
//! progress = [0, 98]
//! outputs = ["{work_dir}/v4_{stem}.bvh"]
//! salvage_extension = "bvh"
//! ```

pub mod defaults;
pub mod template;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::model::{JobStatus, PipelineKind};

pub use template::TemplateVars;

/// How a running stage of this pipeline is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelStyle {
    /// Raise the stop signal and let the tool finish its partial artifact.
    Cooperative,
    /// Kill the process and salvage whatever it left on disk.
    Forced,
}

/// How a tool reports progress on standard output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressFormat {
    /// `TOTAL:` / `PROGRESS:` / `DONE:` / `STOPPED:` lines.
    #[default]
    Protocol,
    /// The protocol, plus `Frame <cur>/<total>` counters printed by the lifter.
    FrameCounter,
}

/// One external tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    /// Job status while this stage runs. Unique within a pipeline.
    pub status: JobStatus,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    pub timeout_secs: u64,
    /// Share of the job's 0-100 range covered by this stage.
    pub progress: (u8, u8),
    /// Default artifact locations. When several exist the largest wins and
    /// ties go to the one listed first.
    pub outputs: Vec<String>,
    /// Extension (without dot) searched for when salvaging a stopped stage.
    #[serde(default)]
    pub salvage_extension: Option<String>,
    #[serde(default)]
    pub progress_format: ProgressFormat,
    /// Final name the artifact is moved to once the stage succeeds.
    #[serde(default)]
    pub rename_to: Option<String>,
}

impl StageSpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Map `cur/total` linearly into the `band` of the job's 0-100 range.
pub fn scale_into(band: (u8, u8), cur: u64, total: u64) -> u8 {
    let (start, end) = band;
    if total == 0 {
        return start;
    }
    // Tool-reported counts are unbounded; widen before multiplying.
    let span = u128::from(end.saturating_sub(start));
    let done = u128::from(cur.min(total));
    (u128::from(start) + span * done / u128::from(total)).min(100) as u8
}

/// Ordered stage list of one pipeline kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub cancel_style: CancelStyle,
    pub stages: Vec<StageSpec>,
}

impl PipelineSpec {
    pub fn stage_for_status(&self, status: JobStatus) -> Option<usize> {
        self.stages.iter().position(|s| s.status == status)
    }

    pub fn final_stage(&self) -> Option<&StageSpec> {
        self.stages.last()
    }

    fn validate(&self, kind: PipelineKind) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::Invalid {
            kind: kind.to_string(),
            message,
        };
        if self.stages.is_empty() {
            return Err(invalid("no stages".into()));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !stage.status.is_active() {
                return Err(invalid(format!(
                    "stage '{}' uses non-stage status '{}'",
                    stage.name, stage.status
                )));
            }
            if !seen.insert(stage.status) {
                return Err(invalid(format!("status '{}' used twice", stage.status)));
            }
            let (start, end) = stage.progress;
            if start > end || end > 100 {
                return Err(invalid(format!(
                    "stage '{}' has progress band {start}..{end}",
                    stage.name
                )));
            }
            if stage.outputs.is_empty() {
                return Err(invalid(format!("stage '{}' declares no outputs", stage.name)));
            }
        }
        Ok(())
    }
}

/// Lookup table from pipeline kind to definition.
#[derive(Debug, Clone, Default)]
pub struct PipelineRegistry {
    pipelines: HashMap<PipelineKind, PipelineSpec>,
}

impl PipelineRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register (or replace) the definition of `kind`.
    pub fn insert(&mut self, kind: PipelineKind, spec: PipelineSpec) -> Result<(), ConfigError> {
        spec.validate(kind)?;
        self.pipelines.insert(kind, spec);
        Ok(())
    }

    pub fn get(&self, kind: PipelineKind) -> Option<&PipelineSpec> {
        self.pipelines.get(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = PipelineKind> + '_ {
        self.pipelines.keys().copied()
    }

    /// Built-in definitions, overridden by `file` when given.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut registry = defaults::builtin();
        if let Some(path) = file {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let count = registry.merge_toml(&raw).map_err(|e| match e {
                MergeError::Parse(source) => ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                },
                MergeError::Config(e) => e,
            })?;
            info!(path = %path.display(), count, "pipeline overrides loaded");
        }
        Ok(registry)
    }

    /// Merge definitions from TOML text. Returns the number of kinds replaced.
    fn merge_toml(&mut self, raw: &str) -> Result<usize, MergeError> {
        let overrides: HashMap<String, PipelineSpec> =
            toml::from_str(raw).map_err(MergeError::Parse)?;
        let count = overrides.len();
        for (name, spec) in overrides {
            let kind = name.parse::<PipelineKind>().map_err(|_| {
                MergeError::Config(ConfigError::Invalid {
                    kind: name.clone(),
                    message: "unknown pipeline kind".into(),
                })
            })?;
            self.insert(kind, spec).map_err(MergeError::Config)?;
        }
        Ok(count)
    }
}

enum MergeError {
    Parse(toml::de::Error),
    Config(ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn builtin_covers_every_kind() {
        let registry = defaults::builtin();
        for kind in PipelineKind::iter() {
            let spec = registry.get(kind).unwrap_or_else(|| panic!("missing {kind}"));
            assert!(!spec.stages.is_empty());
        }
    }

    #[test]
    fn two_dimensional_kinds_are_forced_and_end_in_lifting() {
        let registry = defaults::builtin();
        for kind in PipelineKind::iter() {
            let spec = registry.get(kind).unwrap();
            if kind.is_two_dimensional() {
                assert_eq!(spec.cancel_style, CancelStyle::Forced, "{kind}");
                assert_eq!(spec.stages[0].status, JobStatus::Detecting);
                assert_eq!(spec.final_stage().unwrap().status, JobStatus::Lifting);
            } else {
                assert_eq!(spec.cancel_style, CancelStyle::Cooperative, "{kind}");
                assert_eq!(spec.stages.len(), 1);
                assert_eq!(spec.stages[0].status, JobStatus::Processing);
            }
        }
        let openpose = registry.get(PipelineKind::Openpose).unwrap();
        assert_eq!(openpose.stage_for_status(JobStatus::Converting), Some(1));
    }

    #[test]
    fn scale_into_maps_into_band() {
        let registry = defaults::builtin();
        let detect = registry.get(PipelineKind::Mediapipe).unwrap().stages[0].progress;
        assert_eq!(scale_into(detect, 50, 100), 22);
        assert_eq!(scale_into(detect, 100, 100), 45);
        assert_eq!(scale_into(detect, 500, 100), 45);
        assert_eq!(scale_into(detect, 3, 0), 0);

        let lift = registry.get(PipelineKind::Mediapipe).unwrap().stages[1].progress;
        assert_eq!(scale_into(lift, 0, 10), 50);
        assert_eq!(scale_into(lift, 10, 10), 98);
    }

    #[test]
    fn scale_into_survives_huge_counts() {
        assert_eq!(scale_into((0, 98), u64::MAX, u64::MAX), 98);
        assert_eq!(scale_into((0, 98), u64::MAX / 2, u64::MAX), 48);
        assert_eq!(scale_into((50, 98), u64::MAX, 1), 98);
    }

    #[test]
    fn toml_override_replaces_kind() {
        let mut registry = defaults::builtin();
        let raw = r#"
            [wham]
            cancel_style = "forced"

            [[wham.stages]]
            name = "wham"
            status = "processing"
            program = "/opt/wham/run"
            args = ["{media}", "{work_dir}/out.bvh"]
            timeout_secs = 60
            progress = [0, 90]
            outputs = ["{work_dir}/out.bvh"]
        "#;
        let count = registry.merge_toml(raw).ok().expect("merge");
        assert_eq!(count, 1);
        let wham = registry.get(PipelineKind::Wham).unwrap();
        assert_eq!(wham.cancel_style, CancelStyle::Forced);
        assert_eq!(wham.stages[0].program, "/opt/wham/run");
        assert_eq!(wham.stages[0].progress_format, ProgressFormat::Protocol);
    }

    #[test]
    fn invalid_definitions_are_rejected() {
        let mut registry = PipelineRegistry::empty();
        let mut spec = defaults::builtin().get(PipelineKind::Mediapipe).unwrap().clone();
        spec.stages[1].status = JobStatus::Detecting;
        assert!(matches!(
            registry.insert(PipelineKind::Mediapipe, spec),
            Err(ConfigError::Invalid { .. })
        ));

        let empty = PipelineSpec { cancel_style: CancelStyle::Forced, stages: vec![] };
        assert!(registry.insert(PipelineKind::V4, empty).is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = PipelineRegistry::load(Some(Path::new("/nonexistent/pipelines.toml")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
