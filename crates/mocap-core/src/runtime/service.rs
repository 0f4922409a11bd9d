//! Job lifecycle: submit, start, stop, restart, delete and status.
//!
//! [`JobService`] wires the store, the pipeline registry and the runtime
//! pieces together and is the only type the server binary talks to. Each
//! started job runs its [`ChainExecutor`] on its own task behind a guard that
//! marks the job failed if the run itself panics.

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::RuntimeConfig;
use crate::error::{bounded, ConfigError, ServiceError, MAX_ERROR_CHARS};
use crate::model::{JobId, JobRecord, JobStatus, JobView, PipelineKind};
use crate::pipeline::PipelineRegistry;
use crate::runtime::cancel::{CancelCoordinator, StopAck};
use crate::runtime::executor::{ChainExecutor, Resume};
use crate::runtime::probe::{Ffprobe, FrameRateProbe, ProcessProbe, SystemProbe};
use crate::runtime::registry::{JobClaim, KillReason, ProcessRegistry, StopTarget};
use crate::runtime::stop::{FlagFile, StopSignal};
use crate::runtime::supervisor::ProcessSupervisor;
use crate::runtime::workspace::Workspace;
use crate::store::{JobStore, Outcome};

/// Parameters of a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub input_path: String,
    pub pipeline_kind: PipelineKind,
    /// Source frame rate, probed from the input when `None`.
    pub fps: Option<f64>,
}

/// Replaceable collaborators of a [`JobService`].
pub struct ServiceParts {
    pub store: Arc<dyn JobStore>,
    pub pipelines: PipelineRegistry,
    pub stop: Arc<dyn StopSignal>,
    pub process_probe: Arc<dyn ProcessProbe>,
    pub frame_rate: Arc<dyn FrameRateProbe>,
}

pub struct JobService {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) pipelines: Arc<PipelineRegistry>,
    pub(crate) registry: Arc<ProcessRegistry>,
    pub(crate) workspace: Workspace,
    pub(crate) executor: Arc<ChainExecutor>,
    pub(crate) process_probe: Arc<dyn ProcessProbe>,
    pub(crate) frame_rate: Arc<dyn FrameRateProbe>,
    pub(crate) min_artifact_bytes: u64,
    stop: Arc<dyn StopSignal>,
    cancel: CancelCoordinator,
}

impl JobService {
    /// Service with the default collaborators: pipeline definitions from
    /// `config`, a stop flag file per job, `sysinfo` liveness checks and
    /// `ffprobe` frame rates.
    pub fn new(store: Arc<dyn JobStore>, config: &RuntimeConfig) -> Result<Self, ConfigError> {
        let workspace = Workspace::new(&config.media_root);
        let parts = ServiceParts {
            store,
            pipelines: PipelineRegistry::load(config.pipelines_file.as_deref())?,
            stop: Arc::new(FlagFile::new(workspace)),
            process_probe: Arc::new(SystemProbe::new()),
            frame_rate: Arc::new(Ffprobe::new(&config.ffprobe)),
        };
        Ok(Self::from_parts(parts, config))
    }

    pub fn from_parts(parts: ServiceParts, config: &RuntimeConfig) -> Self {
        let pipelines = Arc::new(parts.pipelines);
        let registry = Arc::new(ProcessRegistry::new());
        let supervisor = Arc::new(ProcessSupervisor::new(
            Arc::clone(&registry),
            Arc::clone(&parts.stop),
            Arc::clone(&parts.process_probe),
            config,
        ));
        let executor = Arc::new(ChainExecutor::new(
            Arc::clone(&parts.store),
            Arc::clone(&pipelines),
            supervisor,
            Arc::clone(&registry),
            Arc::clone(&parts.stop),
            config,
        ));
        let cancel = CancelCoordinator::new(
            Arc::clone(&parts.store),
            Arc::clone(&pipelines),
            Arc::clone(&registry),
            Arc::clone(&parts.stop),
            config.cooperative_grace,
        );

        Self {
            store: parts.store,
            pipelines,
            registry,
            workspace: Workspace::new(&config.media_root),
            executor,
            process_probe: parts.process_probe,
            frame_rate: parts.frame_rate,
            min_artifact_bytes: config.min_artifact_bytes,
            stop: parts.stop,
            cancel,
        }
    }

    pub fn pipelines(&self) -> &PipelineRegistry {
        &self.pipelines
    }

    /// Record a new `pending` job. Nothing runs until [`JobService::start`].
    pub async fn submit(&self, new: NewJob) -> Result<JobRecord, ServiceError> {
        if self.pipelines.get(new.pipeline_kind).is_none() {
            return Err(ServiceError::UnknownPipeline(new.pipeline_kind));
        }
        let fps = match new.fps {
            Some(fps) => Some(fps),
            None => self.frame_rate.frame_rate(Path::new(&new.input_path)).await,
        };
        let job = JobRecord::new(new.name, new.input_path, new.pipeline_kind, fps);
        self.store.insert(&job).await?;
        info!(job_id = %job.id, pipeline = %job.pipeline_kind, name = %job.name, "job submitted");
        Ok(job)
    }

    /// Start a `pending` job on its own task.
    ///
    /// The returned handle resolves once the job's terminal status has been
    /// written; dropping it does not cancel the job.
    pub async fn start(&self, id: JobId) -> Result<JoinHandle<()>, ServiceError> {
        let claim = self.registry.claim(id).ok_or(ServiceError::AlreadyRunning(id))?;
        let job = self.store.get(id).await?.ok_or(ServiceError::NotFound(id))?;
        if job.status != JobStatus::Pending {
            return Err(ServiceError::InvalidState {
                id,
                status: job.status,
                action: "start",
            });
        }
        info!(job_id = %id, run = job.run, "job started");
        Ok(self.spawn_run(claim, job, Resume::Start))
    }

    pub async fn stop(&self, id: JobId) -> Result<StopAck, ServiceError> {
        self.cancel.request_stop(id).await
    }

    /// Run a `complete` or `failed` job again from the first stage.
    pub async fn restart(&self, id: JobId) -> Result<JoinHandle<()>, ServiceError> {
        if self.registry.is_claimed(id) {
            return Err(ServiceError::AlreadyRunning(id));
        }
        let Some(job) = self.store.reset(id, "Restarting").await? else {
            let job = self.store.get(id).await?.ok_or(ServiceError::NotFound(id))?;
            return Err(ServiceError::InvalidState {
                id,
                status: job.status,
                action: "restart",
            });
        };
        self.stop.clear(id);
        self.workspace.clear_pid(id);
        info!(job_id = %id, run = job.run, "job reset for restart");
        self.start(id).await
    }

    /// Kill the job if it is running, then remove its working area and record.
    pub async fn delete(&self, id: JobId) -> Result<(), ServiceError> {
        if self.store.get(id).await?.is_none() {
            return Err(ServiceError::NotFound(id));
        }
        if let StopTarget::Running { kill, .. } = self.registry.request_stop(id) {
            kill.kill(KillReason::Cancelled);
        }
        self.workspace.remove(id)?;
        self.store.delete(id).await?;
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    pub async fn get(&self, id: JobId) -> Result<JobRecord, ServiceError> {
        self.store.get(id).await?.ok_or(ServiceError::NotFound(id))
    }

    pub async fn status(&self, id: JobId) -> Result<JobView, ServiceError> {
        Ok(self.get(id).await?.view())
    }

    pub async fn list(&self) -> Result<Vec<JobRecord>, ServiceError> {
        Ok(self.store.list().await?)
    }

    pub fn is_running(&self, id: JobId) -> bool {
        self.registry.is_claimed(id)
    }

    /// Run the chain for `job` behind the crash guard. `claim` is held until
    /// the terminal status has been written.
    pub(crate) fn spawn_run(&self, claim: JobClaim, job: JobRecord, resume: Resume) -> JoinHandle<()> {
        let executor = Arc::clone(&self.executor);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let (id, run) = (job.id, job.run);
            let task = tokio::spawn(async move { executor.execute(&job, resume).await });
            let crash = match task.await {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(crash) = crash {
                error!(job_id = %id, error = %crash, "job runner crashed");
                let outcome = Outcome::Failed {
                    error: bounded(&format!("Unexpected crash: {crash}"), MAX_ERROR_CHARS),
                    detail: None,
                };
                if let Err(e) = store.finish(id, run, &outcome).await {
                    error!(job_id = %id, error = %e, "failed to record crash");
                }
            }
            drop(claim);
        })
    }
}
