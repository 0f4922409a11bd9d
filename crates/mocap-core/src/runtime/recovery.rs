//! Startup pass over jobs a previous service instance left unfinished.
//!
//! For each job left in a stage state that nothing in this process is
//! running (pending jobs never started and are left alone):
//!
//! 1. a valid final artifact on disk completes the job;
//! 2. otherwise a live process behind the job's pid marker is re-attached and
//!    the chain continues once it exits;
//! 3. otherwise the job fails with a message saying it can be restarted.
//!
//! The pass is idempotent; running it twice changes nothing the first run
//! did not already settle.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{PipelineError, StoreError};
use crate::model::{JobId, JobRecord, JobStatus};
use crate::runtime::artifact::{salvage, SalvageRule};
use crate::runtime::executor::Resume;
use crate::runtime::service::JobService;
use crate::store::Outcome;

pub const DETAIL_RECOVERED: &str = "Complete (recovered after restart)";
pub const DETAIL_INTERRUPTED: &str = "Interrupted by service restart";

/// Jobs touched by one [`JobService::recover_orphans`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub completed: Vec<JobId>,
    pub reattached: Vec<JobId>,
    pub failed: Vec<JobId>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.reattached.is_empty() && self.failed.is_empty()
    }
}

#[derive(Debug)]
enum Verdict {
    Complete(PathBuf),
    Alive { stage: usize, pid: u32 },
    Orphaned,
}

impl JobService {
    /// Settle every job left in a non-terminal state. Call once at startup,
    /// before new work is accepted.
    pub async fn recover_orphans(&self) -> Result<RecoveryReport, StoreError> {
        let mut report = RecoveryReport::default();
        let jobs = self.store.list_by_status(JobStatus::active()).await?;

        for job in jobs {
            if self.registry.is_claimed(job.id) {
                continue;
            }
            match self.assess(&job) {
                Verdict::Complete(artifact) => {
                    let fps = self.frame_rate.frame_rate(Path::new(&job.input_path)).await;
                    let outcome = Outcome::Complete {
                        artifact_path: artifact.to_string_lossy().into_owned(),
                        detail: DETAIL_RECOVERED.to_owned(),
                        fps,
                    };
                    if self.store.finish(job.id, job.run, &outcome).await? {
                        self.workspace.clear_pid(job.id);
                        info!(job_id = %job.id, artifact = %artifact.display(), "recovered completed job");
                        report.completed.push(job.id);
                    }
                }
                Verdict::Alive { stage, pid } => {
                    let Some(claim) = self.registry.claim(job.id) else {
                        continue;
                    };
                    info!(job_id = %job.id, pid, stage, "re-attaching to running process");
                    self.spawn_run(claim, job.clone(), Resume::Adopt { stage, pid });
                    report.reattached.push(job.id);
                }
                Verdict::Orphaned => {
                    let outcome = Outcome::Failed {
                        error: PipelineError::OrphanRecovery.to_string(),
                        detail: Some(DETAIL_INTERRUPTED.to_owned()),
                    };
                    if self.store.finish(job.id, job.run, &outcome).await? {
                        warn!(job_id = %job.id, status = %job.status, "job orphaned by restart");
                        report.failed.push(job.id);
                    }
                }
            }
        }

        info!(
            completed = report.completed.len(),
            reattached = report.reattached.len(),
            failed = report.failed.len(),
            "orphan recovery finished"
        );
        Ok(report)
    }

    fn assess(&self, job: &JobRecord) -> Verdict {
        if let Some(artifact) = self.final_artifact(job) {
            return Verdict::Complete(artifact);
        }
        if let Some(pid) = self.workspace.read_pid(job.id) {
            if self.process_probe.is_alive(pid) {
                let stage = self
                    .pipelines
                    .get(job.pipeline_kind)
                    .and_then(|spec| spec.stage_for_status(job.status))
                    .unwrap_or(0);
                return Verdict::Alive { stage, pid };
            }
            self.workspace.clear_pid(job.id);
        }
        Verdict::Orphaned
    }

    /// A structurally valid artifact of the pipeline's last stage.
    fn final_artifact(&self, job: &JobRecord) -> Option<PathBuf> {
        let stage = self.pipelines.get(job.pipeline_kind)?.final_stage()?;
        let candidates = self
            .executor
            .invocation(job, stage, Path::new(&job.intermediate_path))
            .map(|inv| inv.outputs)
            .unwrap_or_default();
        let rule = SalvageRule {
            candidates: &candidates,
            extension: Some(stage.salvage_extension.as_deref().unwrap_or("bvh")),
            min_bytes: self.min_artifact_bytes,
        };
        salvage(&self.workspace.job_dir(job.id), &rule)
    }
}
