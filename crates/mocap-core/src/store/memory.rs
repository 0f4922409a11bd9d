//! In-memory [`JobStore`], used by tests and as a drop-in fake.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{accepts, JobStore, Outcome};
use crate::error::StoreError;
use crate::model::{JobId, JobRecord, JobStatus};

/// Map-backed store. Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    inner: Arc<RwLock<HashMap<JobId, JobRecord>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `f` if the run guard allows it.
    async fn guarded<F>(&self, id: JobId, run: i64, f: F) -> bool
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut map = self.inner.write().await;
        match map.get_mut(&id) {
            Some(job) if accepts(job, run) => {
                f(job);
                job.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &JobRecord) -> Result<(), StoreError> {
        self.inner.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.inner.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut jobs: Vec<_> = self.inner.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn list_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<JobRecord>, StoreError> {
        let mut jobs = self.list().await?;
        jobs.retain(|j| statuses.contains(&j.status));
        Ok(jobs)
    }

    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.inner.write().await.remove(&id).is_some())
    }

    async fn enter_stage(
        &self,
        id: JobId,
        run: i64,
        status: JobStatus,
        progress: u8,
        detail: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .guarded(id, run, |job| {
                job.status = status;
                job.progress = job.progress.max(progress.min(100));
                job.progress_detail = detail.to_owned();
            })
            .await)
    }

    async fn update_progress(
        &self,
        id: JobId,
        run: i64,
        progress: u8,
        detail: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .guarded(id, run, |job| {
                job.progress = job.progress.max(progress.min(100));
                job.progress_detail = detail.to_owned();
            })
            .await)
    }

    async fn set_intermediate(&self, id: JobId, run: i64, path: &str) -> Result<bool, StoreError> {
        Ok(self
            .guarded(id, run, |job| job.intermediate_path = path.to_owned())
            .await)
    }

    async fn finish(&self, id: JobId, run: i64, outcome: &Outcome) -> Result<bool, StoreError> {
        Ok(self
            .guarded(id, run, |job| match outcome {
                Outcome::Complete {
                    artifact_path,
                    detail,
                    fps,
                } => {
                    job.status = JobStatus::Complete;
                    job.progress = 100;
                    job.progress_detail = detail.clone();
                    job.error.clear();
                    job.artifact_path = artifact_path.clone();
                    if let Some(fps) = fps {
                        job.fps = *fps;
                    }
                }
                Outcome::Failed { error, detail } => {
                    job.status = JobStatus::Failed;
                    job.error = error.clone();
                    if let Some(detail) = detail {
                        job.progress_detail = detail.clone();
                    }
                }
            })
            .await)
    }

    async fn reset(&self, id: JobId, detail: &str) -> Result<Option<JobRecord>, StoreError> {
        let mut map = self.inner.write().await;
        let Some(job) = map.get_mut(&id) else {
            return Ok(None);
        };
        if !job.status.is_terminal() {
            return Ok(None);
        }
        job.status = JobStatus::Pending;
        job.progress = 0;
        job.progress_detail = detail.to_owned();
        job.error.clear();
        job.artifact_path.clear();
        job.intermediate_path.clear();
        job.run += 1;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }
}
