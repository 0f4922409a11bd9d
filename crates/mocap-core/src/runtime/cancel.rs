//! Stop requests.
//!
//! A request raises the job's stop signal and then acts according to the
//! pipeline's [`CancelStyle`]: forced pipelines have their process killed at
//! once, cooperative ones get a grace window to wrap up before the kill. The
//! call itself never waits for the job to reach a terminal state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::ServiceError;
use crate::model::JobId;
use crate::pipeline::{CancelStyle, PipelineRegistry};
use crate::runtime::executor::{CANCELLED_BY_USER, DETAIL_CANCELLED};
use crate::runtime::registry::{KillReason, KillSwitch, ProcessRegistry, StopTarget};
use crate::runtime::stop::StopSignal;
use crate::store::{JobStore, Outcome};

/// What a stop request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAck {
    /// The job was already `complete` or `failed`.
    AlreadyFinished,
    /// Nothing was running it; it has been marked failed.
    Cancelled,
    /// The running process was signalled; its run will write the outcome.
    Requested,
}

pub struct CancelCoordinator {
    store: Arc<dyn JobStore>,
    pipelines: Arc<PipelineRegistry>,
    registry: Arc<ProcessRegistry>,
    stop: Arc<dyn StopSignal>,
    grace: Duration,
}

impl CancelCoordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        pipelines: Arc<PipelineRegistry>,
        registry: Arc<ProcessRegistry>,
        stop: Arc<dyn StopSignal>,
        grace: Duration,
    ) -> Self {
        Self {
            store,
            pipelines,
            registry,
            stop,
            grace,
        }
    }

    pub async fn request_stop(&self, id: JobId) -> Result<StopAck, ServiceError> {
        let job = self.store.get(id).await?.ok_or(ServiceError::NotFound(id))?;
        if job.status.is_terminal() {
            return Ok(StopAck::AlreadyFinished);
        }
        let style = self
            .pipelines
            .get(job.pipeline_kind)
            .map_or(CancelStyle::Forced, |p| p.cancel_style);

        match self.registry.request_stop(id) {
            StopTarget::NotRunning => {
                let outcome = Outcome::Failed {
                    error: CANCELLED_BY_USER.to_owned(),
                    detail: Some(DETAIL_CANCELLED.to_owned()),
                };
                let landed = self.store.finish(id, job.run, &outcome).await?;
                info!(job_id = %id, landed, "stopped job with no running process");
                Ok(StopAck::Cancelled)
            }
            StopTarget::Idle => {
                self.raise(id);
                info!(job_id = %id, "stop recorded between stages");
                Ok(StopAck::Requested)
            }
            StopTarget::Running { pid, stage, kill, exited } => {
                self.raise(id);
                info!(job_id = %id, %stage, pid, ?style, "stop requested");
                match style {
                    CancelStyle::Forced => kill.kill(KillReason::Cancelled),
                    CancelStyle::Cooperative => {
                        tokio::spawn(escalate_after(id, self.grace, kill, exited));
                    }
                }
                Ok(StopAck::Requested)
            }
        }
    }

    fn raise(&self, id: JobId) {
        if let Err(e) = self.stop.raise(id) {
            warn!(job_id = %id, error = %e, "failed to raise stop signal");
        }
    }
}

/// Kill the process if it has not exited `grace` after a cooperative stop.
async fn escalate_after(
    id: JobId,
    grace: Duration,
    kill: KillSwitch,
    mut exited: watch::Receiver<bool>,
) {
    if tokio::time::timeout(grace, exited.wait_for(|done| *done)).await.is_err() {
        warn!(job_id = %id, grace_secs = grace.as_secs(), "cooperative stop timed out; killing");
        kill.kill(KillReason::GraceExpired);
    }
}
