//! Built-in pipeline definitions.
//!
//! 2D kinds run a keypoint detector and hand its CSV to the MocapNET v2.1
//! lifter; the detectors do not watch the stop flag, so these pipelines are
//! stopped by force and the partial CSV is lifted. 3D kinds are a single
//! tool that watches the stop flag and writes a partial BVH itself.

use super::{CancelStyle, PipelineRegistry, PipelineSpec, ProgressFormat, StageSpec};
use crate::model::{JobStatus, PipelineKind};

const DETECT_TIMEOUT_SECS: u64 = 600;
const WRAPPED_DETECT_TIMEOUT_SECS: u64 = 1800;
const CONVERT_TIMEOUT_SECS: u64 = 300;
const LIFT_TIMEOUT_SECS: u64 = 1200;
const SINGLE_STAGE_TIMEOUT_SECS: u64 = 1800;
const HMR_TIMEOUT_SECS: u64 = 3600;

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

fn mediapipe_detect() -> StageSpec {
    StageSpec {
        name: "mediapipe".into(),
        status: JobStatus::Detecting,
        program: "{python}".into(),
        args: args(&[
            "{tools}/MocapNET/src/python/mediapipe/mediapipeHolistic2CSV.py",
            "--from",
            "{media}",
            "-o",
            "{work_dir}/frames",
            "--headless",
            "--progress-interval",
            "1",
        ]),
        cwd: Some("{tools}/MocapNET".into()),
        timeout_secs: DETECT_TIMEOUT_SECS,
        progress: (0, 45),
        outputs: args(&["{work_dir}/frames-mpdata/2dJoints_mediapipe.csv"]),
        salvage_extension: Some("csv".into()),
        progress_format: ProgressFormat::Protocol,
        rename_to: None,
    }
}

fn openpose_detect() -> StageSpec {
    StageSpec {
        name: "openpose".into(),
        status: JobStatus::Detecting,
        program: "{python}".into(),
        args: args(&[
            "{tools}/wrappers/openpose_detect.py",
            "--from",
            "{media}",
            "--json-dir",
            "{work_dir}/openpose_json",
        ]),
        cwd: Some("{tools}/OpenPose".into()),
        timeout_secs: WRAPPED_DETECT_TIMEOUT_SECS,
        progress: (0, 40),
        outputs: args(&["{work_dir}/openpose_json"]),
        salvage_extension: Some("json".into()),
        progress_format: ProgressFormat::Protocol,
        rename_to: None,
    }
}

fn openpose_convert() -> StageSpec {
    StageSpec {
        name: "openpose_csv".into(),
        status: JobStatus::Converting,
        program: "{python}".into(),
        args: args(&[
            "{tools}/wrappers/openpose_json_to_csv.py",
            "--from",
            "{input}",
            "-o",
            "{work_dir}/openpose_2d.csv",
        ]),
        cwd: Some("{tools}/MocapNET".into()),
        timeout_secs: CONVERT_TIMEOUT_SECS,
        progress: (40, 50),
        outputs: args(&["{work_dir}/openpose_2d.csv"]),
        salvage_extension: Some("csv".into()),
        progress_format: ProgressFormat::Protocol,
        rename_to: None,
    }
}

/// Detector behind a wrapper script named after the pipeline kind.
fn wrapped_detect() -> StageSpec {
    StageSpec {
        name: "{pipeline}".into(),
        status: JobStatus::Detecting,
        program: "{python}".into(),
        args: args(&[
            "{tools}/wrappers/{pipeline}_2d.py",
            "--from",
            "{media}",
            "-o",
            "{work_dir}/{pipeline}_2d.csv",
        ]),
        cwd: Some("{tools}/wrappers".into()),
        timeout_secs: WRAPPED_DETECT_TIMEOUT_SECS,
        progress: (0, 45),
        outputs: args(&["{work_dir}/{pipeline}_2d.csv"]),
        salvage_extension: Some("csv".into()),
        progress_format: ProgressFormat::Protocol,
        rename_to: None,
    }
}

/// MocapNET v2.1 writes to the exact `-o` path, without extension, and some
/// builds append `.bvh`. Both names are candidates.
fn mocapnet_lift() -> StageSpec {
    StageSpec {
        name: "mocapnet".into(),
        status: JobStatus::Lifting,
        program: "{tools}/MocapNET/MocapNET2CSV".into(),
        args: args(&[
            "--from",
            "{input}",
            "-o",
            "{work_dir}/{pipeline}_{stem}",
            "--hands",
            "--show",
            "0",
        ]),
        cwd: Some("{tools}/MocapNET".into()),
        timeout_secs: LIFT_TIMEOUT_SECS,
        progress: (50, 98),
        outputs: args(&["{work_dir}/{pipeline}_{stem}", "{work_dir}/{pipeline}_{stem}.bvh"]),
        salvage_extension: Some("bvh".into()),
        progress_format: ProgressFormat::FrameCounter,
        rename_to: Some("{work_dir}/{pipeline}_{stem}.bvh".into()),
    }
}

fn v4() -> StageSpec {
    StageSpec {
        name: "v4".into(),
        status: JobStatus::Processing,
        program: "{python}".into(),
        args: args(&[
            "{tools}/MocapNET_v4/run_v4_pipeline.py",
            "--from",
            "{media}",
            "--output",
            "{work_dir}/v4_{stem}.bvh",
            "--all",
            "--headless",
            "--stop-flag",
            "{stop_flag}",
        ]),
        cwd: Some("{tools}/MocapNET_v4".into()),
        timeout_secs: SINGLE_STAGE_TIMEOUT_SECS,
        progress: (0, 98),
        outputs: args(&["{work_dir}/v4_{stem}.bvh"]),
        salvage_extension: Some("bvh".into()),
        progress_format: ProgressFormat::Protocol,
        rename_to: None,
    }
}

/// Human mesh recovery tools behind a BVH-exporting wrapper.
fn hmr() -> StageSpec {
    StageSpec {
        name: "{pipeline}".into(),
        status: JobStatus::Processing,
        program: "{python}".into(),
        args: args(&[
            "{tools}/wrappers/{pipeline}_to_bvh.py",
            "--from",
            "{media}",
            "--output",
            "{work_dir}/{pipeline}_{stem}.bvh",
            "--stop-flag",
            "{stop_flag}",
        ]),
        cwd: Some("{tools}/wrappers".into()),
        timeout_secs: HMR_TIMEOUT_SECS,
        progress: (0, 98),
        outputs: args(&["{work_dir}/{pipeline}_{stem}.bvh"]),
        salvage_extension: Some("bvh".into()),
        progress_format: ProgressFormat::Protocol,
        rename_to: None,
    }
}

fn forced(stages: Vec<StageSpec>) -> PipelineSpec {
    PipelineSpec {
        cancel_style: CancelStyle::Forced,
        stages,
    }
}

fn cooperative(stage: StageSpec) -> PipelineSpec {
    PipelineSpec {
        cancel_style: CancelStyle::Cooperative,
        stages: vec![stage],
    }
}

/// The registry used when no pipeline file is configured.
pub fn builtin() -> PipelineRegistry {
    let mut pipelines = PipelineRegistry::empty();
    let entries = [
        (PipelineKind::Mediapipe, forced(vec![mediapipe_detect(), mocapnet_lift()])),
        (
            PipelineKind::Openpose,
            forced(vec![openpose_detect(), openpose_convert(), mocapnet_lift()]),
        ),
        (PipelineKind::Rtmpose, forced(vec![wrapped_detect(), mocapnet_lift()])),
        (PipelineKind::Vitpose, forced(vec![wrapped_detect(), mocapnet_lift()])),
        (PipelineKind::Yolo11, forced(vec![wrapped_detect(), mocapnet_lift()])),
        (PipelineKind::V4, cooperative(v4())),
        (PipelineKind::Gvhmr, cooperative(hmr())),
        (PipelineKind::Wham, cooperative(hmr())),
        (PipelineKind::Prompthmr, cooperative(hmr())),
    ];
    for (kind, spec) in entries {
        if let Err(e) = pipelines.insert(kind, spec) {
            tracing::error!(%kind, error = %e, "built-in pipeline definition rejected");
        }
    }
    pipelines
}
