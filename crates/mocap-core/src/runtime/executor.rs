//! Runs a job's stages in order and writes its terminal status.
//!
//! Each stage's artifact becomes the next stage's `{input}`. A stage that
//! was stopped early but left a usable partial artifact counts as finished,
//! and the chain goes on with that partial; any other stage failure ends the
//! chain. The executor is the only writer of terminal status for its run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::error::{bounded, PipelineError, MAX_ERROR_CHARS};
use crate::model::{JobId, JobRecord};
use crate::pipeline::{PipelineRegistry, PipelineSpec, StageSpec, TemplateVars};
use crate::runtime::artifact::finalize_name;
use crate::runtime::registry::ProcessRegistry;
use crate::runtime::stop::StopSignal;
use crate::runtime::supervisor::{ProcessSupervisor, StageInvocation, StageOutput};
use crate::runtime::throttle::ProgressReporter;
use crate::store::{JobStore, Outcome};

pub const DETAIL_DONE: &str = "Done";
pub const DETAIL_PARTIAL: &str = "Done (partial, stopped early)";
pub const DETAIL_CANCELLED: &str = "Cancelled";
pub const CANCELLED_BY_USER: &str = "Cancelled by user";

/// Where a run picks up.
#[derive(Debug, Clone)]
pub enum Resume {
    /// Fresh run from the first stage.
    Start,
    /// A process from a previous service instance is still running stage
    /// `stage`; wait for it, then continue.
    Adopt { stage: usize, pid: u32 },
}

pub struct ChainExecutor {
    store: Arc<dyn JobStore>,
    pipelines: Arc<PipelineRegistry>,
    supervisor: Arc<ProcessSupervisor>,
    registry: Arc<ProcessRegistry>,
    stop: Arc<dyn StopSignal>,
    tools_root: PathBuf,
    python: String,
    progress_interval: Duration,
}

impl ChainExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        pipelines: Arc<PipelineRegistry>,
        supervisor: Arc<ProcessSupervisor>,
        registry: Arc<ProcessRegistry>,
        stop: Arc<dyn StopSignal>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            store,
            pipelines,
            supervisor,
            registry,
            stop,
            tools_root: config.tools_root.clone(),
            python: config.python.clone(),
            progress_interval: config.progress_interval,
        }
    }

    /// Run `job` and persist its terminal status.
    ///
    /// Returns whether the terminal write landed; `false` means the record
    /// had already moved on (finished by a stop request, or restarted).
    pub async fn execute(&self, job: &JobRecord, resume: Resume) -> Result<bool, PipelineError> {
        let outcome = match self.run(job, resume).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                info!(job_id = %job.id, run = job.run, "record moved on; abandoning run");
                return Ok(false);
            }
            Err(e) => Outcome::Failed {
                error: bounded(&e.to_string(), MAX_ERROR_CHARS),
                detail: None,
            },
        };

        let landed = self.store.finish(job.id, job.run, &outcome).await?;
        match &outcome {
            Outcome::Complete { artifact_path, detail, .. } => {
                info!(job_id = %job.id, artifact = %artifact_path, %detail, landed, "job complete")
            }
            Outcome::Failed { error, .. } => {
                warn!(job_id = %job.id, error = %error, landed, "job failed")
            }
        }
        self.stop.clear(job.id);
        Ok(landed)
    }

    /// `None` when the store stopped accepting this run's writes.
    async fn run(&self, job: &JobRecord, resume: Resume) -> Result<Option<Outcome>, PipelineError> {
        let spec = self
            .pipelines
            .get(job.pipeline_kind)
            .ok_or(PipelineError::NotConfigured(job.pipeline_kind))?;

        let (next, input, partial) = match resume {
            Resume::Start => {
                self.stop.clear(job.id);
                (0, PathBuf::from(&job.input_path), false)
            }
            Resume::Adopt { stage, pid } => {
                let spec_stage = spec
                    .stages
                    .get(stage)
                    .ok_or(PipelineError::OrphanRecovery)?;
                let input = adopted_input(job);
                let inv = self.invocation(job, spec_stage, &input)?;
                let out = self.supervisor.adopt(&inv, pid).await?;
                match self.after_stage(job, spec, stage, &inv, out, false).await? {
                    Step::Next { input, partial } => (stage + 1, input, partial),
                    Step::Finished(outcome) => return Ok(Some(outcome)),
                }
            }
        };

        self.run_from(job, spec, next, input, partial).await
    }

    async fn run_from(
        &self,
        job: &JobRecord,
        spec: &PipelineSpec,
        first: usize,
        mut input: PathBuf,
        mut partial: bool,
    ) -> Result<Option<Outcome>, PipelineError> {
        let multi_stage = spec.stages.len() > 1;

        for (idx, stage) in spec.stages.iter().enumerate().skip(first) {
            if self.registry.stop_requested(job.id) {
                return Ok(Some(Outcome::Failed {
                    error: CANCELLED_BY_USER.to_owned(),
                    detail: Some(DETAIL_CANCELLED.to_owned()),
                }));
            }

            let inv = self.invocation(job, stage, &input)?;
            let detail = format!("Running {}", inv.stage);
            let entered = self
                .store
                .enter_stage(job.id, job.run, stage.status, stage.progress.0, &detail)
                .await?;
            if !entered {
                return Ok(None);
            }

            let mut reporter = ProgressReporter::new(
                Arc::clone(&self.store),
                job.id,
                job.run,
                stage.progress,
                self.progress_interval,
            );
            if multi_stage {
                reporter = reporter.with_label(inv.stage.clone());
            }

            let out = self.supervisor.run_stage(&inv, &mut reporter).await?;
            match self.after_stage(job, spec, idx, &inv, out, partial).await? {
                Step::Next { input: next, partial: p } => {
                    input = next;
                    partial = p;
                }
                Step::Finished(outcome) => return Ok(Some(outcome)),
            }
        }

        // Only reachable when `first` is past the last stage.
        Err(PipelineError::ArtifactMissing {
            stage: spec.final_stage().map(|s| s.name.clone()).unwrap_or_default(),
        })
    }

    /// Hand a finished stage's artifact on, or finalize the job after the
    /// last stage.
    async fn after_stage(
        &self,
        job: &JobRecord,
        spec: &PipelineSpec,
        idx: usize,
        inv: &StageInvocation,
        out: StageOutput,
        chain_partial: bool,
    ) -> Result<Step, PipelineError> {
        let partial = chain_partial || out.partial;
        if out.partial {
            // The stop request was for this stage; later stages run normally.
            self.stop.clear(job.id);
            self.registry.clear_stop(job.id);
        }

        if idx + 1 < spec.stages.len() {
            self.store
                .set_intermediate(job.id, job.run, &out.artifact.to_string_lossy())
                .await?;
            return Ok(Step::Next {
                input: out.artifact,
                partial,
            });
        }

        let artifact = final_name(job.id, inv, out.artifact);
        Ok(Step::Finished(Outcome::Complete {
            artifact_path: artifact.to_string_lossy().into_owned(),
            detail: if partial { DETAIL_PARTIAL } else { DETAIL_DONE }.to_owned(),
            fps: None,
        }))
    }

    fn vars(&self, job: &JobRecord, input: &Path) -> TemplateVars {
        let workspace = self.supervisor.workspace();
        let stop_flag = self
            .stop
            .flag_path(job.id)
            .unwrap_or_else(|| workspace.stop_flag(job.id));
        TemplateVars::new()
            .set("input", input.to_string_lossy())
            .set("media", job.input_path.as_str())
            .set("work_dir", workspace.job_dir(job.id).to_string_lossy())
            .set("stop_flag", stop_flag.to_string_lossy())
            .set("tools", self.tools_root.to_string_lossy())
            .set("python", self.python.as_str())
            .set("stem", job.stem())
            .set("pipeline", job.pipeline_kind.to_string())
            .set("job_id", job.id.to_string())
    }

    /// Substitute the job's values into `stage`.
    pub fn invocation(
        &self,
        job: &JobRecord,
        stage: &StageSpec,
        input: &Path,
    ) -> Result<StageInvocation, PipelineError> {
        let vars = self.vars(job, input);
        let render = |template: &str| {
            vars.render(template).map_err(|message| PipelineError::Template {
                stage: stage.name.clone(),
                message,
            })
        };

        Ok(StageInvocation {
            job: job.id,
            stage: render(&stage.name)?,
            program: render(&stage.program)?,
            args: stage.args.iter().map(|a| render(a)).collect::<Result<_, _>>()?,
            cwd: stage.cwd.as_deref().map(|c| render(c)).transpose()?.map(PathBuf::from),
            timeout: stage.timeout(),
            outputs: stage
                .outputs
                .iter()
                .map(|o| render(o).map(PathBuf::from))
                .collect::<Result<_, _>>()?,
            salvage_extension: stage.salvage_extension.clone(),
            progress_format: stage.progress_format,
            rename_to: stage.rename_to.as_deref().map(|r| render(r)).transpose()?.map(PathBuf::from),
        })
    }
}

enum Step {
    Next { input: PathBuf, partial: bool },
    Finished(Outcome),
}

/// Move a default-location artifact to the stage's final name. Paths a tool
/// reported itself are left where they are.
fn final_name(job: JobId, inv: &StageInvocation, artifact: PathBuf) -> PathBuf {
    let Some(target) = &inv.rename_to else {
        return artifact;
    };
    if !inv.outputs.contains(&artifact) || !artifact.is_file() {
        return artifact;
    }
    match finalize_name(&artifact, Some(target)) {
        Ok(path) => path,
        Err(e) => {
            warn!(
                job_id = %job,
                from = %artifact.display(),
                to = %target.display(),
                error = %e,
                "rename failed; keeping tool output name"
            );
            artifact
        }
    }
}

/// Input of a stage a previous service instance was running.
fn adopted_input(job: &JobRecord) -> PathBuf {
    if job.intermediate_path.is_empty() {
        PathBuf::from(&job.input_path)
    } else {
        PathBuf::from(&job.intermediate_path)
    }
}
