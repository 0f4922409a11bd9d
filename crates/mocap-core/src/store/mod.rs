//! Job record persistence.
//!
//! [`JobStore`] is the interface the orchestration core writes through. The
//! default implementation is [`sqlite::SqliteJobStore`]; [`memory::MemoryJobStore`]
//! keeps everything in a map and is what the runtime tests inject.
//!
//! Every mutating call made on behalf of a run carries that run's number.
//! Implementations must drop the write (returning `false`) when the record has
//! moved on to a newer run or has already reached a terminal status. This gives
//! a causal "last writer wins" order without comparing wall clocks: a progress
//! event that arrives after the terminal write of its own run is discarded, and
//! nothing from a previous run can touch a restarted job.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{JobId, JobRecord, JobStatus};

/// Terminal transition written once per run.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Complete {
        artifact_path: String,
        detail: String,
        /// Replaces the stored frame rate when `Some`.
        fps: Option<f64>,
    },
    Failed {
        error: String,
        /// Replaces the stored detail when `Some`.
        detail: Option<String>,
    },
}

#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Persist a newly submitted record.
    async fn insert(&self, job: &JobRecord) -> Result<(), StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// All records, newest first.
    async fn list(&self) -> Result<Vec<JobRecord>, StoreError>;

    async fn list_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<JobRecord>, StoreError>;

    /// Returns `true` if a record was removed.
    async fn delete(&self, id: JobId) -> Result<bool, StoreError>;

    /// Move the job into a stage status. `progress` is raised, never lowered.
    async fn enter_stage(
        &self,
        id: JobId,
        run: i64,
        status: JobStatus,
        progress: u8,
        detail: &str,
    ) -> Result<bool, StoreError>;

    /// Progress write. `progress` is raised, never lowered.
    async fn update_progress(
        &self,
        id: JobId,
        run: i64,
        progress: u8,
        detail: &str,
    ) -> Result<bool, StoreError>;

    async fn set_intermediate(&self, id: JobId, run: i64, path: &str) -> Result<bool, StoreError>;

    /// Write the terminal status of `run`. Only the first call per run lands.
    async fn finish(&self, id: JobId, run: i64, outcome: &Outcome) -> Result<bool, StoreError>;

    /// Return a `complete`/`failed` job to `pending` under a new run number,
    /// clearing progress, error and artifacts. `None` if the job is missing or
    /// not terminal.
    async fn reset(&self, id: JobId, detail: &str) -> Result<Option<JobRecord>, StoreError>;
}

/// Whether a write tagged with `run` may still touch `job`.
pub(crate) fn accepts(job: &JobRecord, run: i64) -> bool {
    job.run == run && !job.status.is_terminal()
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryJobStore;
    use super::sqlite::SqliteJobStore;
    use super::*;
    use crate::model::PipelineKind;

    async fn sqlite_store(dir: &tempfile::TempDir) -> SqliteJobStore {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("jobs.db").display());
        SqliteJobStore::connect(&url).await.expect("connect sqlite")
    }

    async fn guards_terminal_writes(store: &dyn JobStore) {
        let job = JobRecord::new("walk.mp4", "/media/walk.mp4", PipelineKind::Mediapipe, None);
        store.insert(&job).await.unwrap();

        assert!(store.enter_stage(job.id, 0, JobStatus::Detecting, 0, "0 / 10 frames").await.unwrap());
        assert!(store.update_progress(job.id, 0, 40, "4 / 10 frames").await.unwrap());
        // Late, out-of-order progress never lowers the value.
        assert!(store.update_progress(job.id, 0, 20, "2 / 10 frames").await.unwrap());
        assert_eq!(store.get(job.id).await.unwrap().unwrap().progress, 40);

        let done = Outcome::Complete {
            artifact_path: "/out/walk.bvh".into(),
            detail: "Done".into(),
            fps: Some(25.0),
        };
        assert!(store.finish(job.id, 0, &done).await.unwrap());

        let failed = Outcome::Failed { error: "late".into(), detail: None };
        assert!(!store.finish(job.id, 0, &failed).await.unwrap());
        assert!(!store.update_progress(job.id, 0, 60, "stale").await.unwrap());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Complete);
        assert_eq!(stored.progress, 100);
        assert_eq!(stored.artifact_path, "/out/walk.bvh");
        assert_eq!(stored.fps, 25.0);
        assert!(stored.error.is_empty());
    }

    async fn reset_starts_new_run(store: &dyn JobStore) {
        let job = JobRecord::new("jump.mp4", "/media/jump.mp4", PipelineKind::V4, None);
        store.insert(&job).await.unwrap();

        // Not terminal yet.
        assert!(store.reset(job.id, "Queued").await.unwrap().is_none());

        store
            .finish(job.id, 0, &Outcome::Failed { error: "boom".into(), detail: None })
            .await
            .unwrap();
        let reset = store.reset(job.id, "Queued").await.unwrap().expect("reset");
        assert_eq!(reset.status, JobStatus::Pending);
        assert_eq!(reset.run, 1);
        assert_eq!(reset.progress, 0);
        assert!(reset.error.is_empty());
        assert!(reset.artifact_path.is_empty());

        // Writes from the previous run are ignored.
        assert!(!store.enter_stage(job.id, 0, JobStatus::Processing, 10, "old").await.unwrap());
        assert!(store.enter_stage(job.id, 1, JobStatus::Processing, 0, "new").await.unwrap());
    }

    async fn isolates_jobs(store: &dyn JobStore) {
        let a = JobRecord::new("a.mp4", "/a.mp4", PipelineKind::Wham, None);
        let b = JobRecord::new("b.mp4", "/b.mp4", PipelineKind::Gvhmr, None);
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();

        store.enter_stage(a.id, 0, JobStatus::Processing, 30, "a").await.unwrap();
        store.set_intermediate(a.id, 0, "/tmp/a.csv").await.unwrap();

        let b_after = store.get(b.id).await.unwrap().unwrap();
        assert_eq!(b_after.status, JobStatus::Pending);
        assert_eq!(b_after.progress, 0);
        assert!(b_after.intermediate_path.is_empty());

        let active = store.list_by_status(&[JobStatus::Processing]).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);
        assert_eq!(store.list().await.unwrap().len(), 2);

        assert!(store.delete(a.id).await.unwrap());
        assert!(!store.delete(a.id).await.unwrap());
        assert!(store.get(a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_guards_terminal_writes() {
        guards_terminal_writes(&MemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn memory_store_reset_starts_new_run() {
        reset_starts_new_run(&MemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn memory_store_isolates_jobs() {
        isolates_jobs(&MemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_guards_terminal_writes() {
        let dir = tempfile::tempdir().unwrap();
        guards_terminal_writes(&sqlite_store(&dir).await).await;
    }

    #[tokio::test]
    async fn sqlite_store_reset_starts_new_run() {
        let dir = tempfile::tempdir().unwrap();
        reset_starts_new_run(&sqlite_store(&dir).await).await;
    }

    #[tokio::test]
    async fn sqlite_store_isolates_jobs() {
        let dir = tempfile::tempdir().unwrap();
        isolates_jobs(&sqlite_store(&dir).await).await;
    }

    #[tokio::test]
    async fn sqlite_in_memory_round_trips_a_record() {
        let store = SqliteJobStore::connect("sqlite::memory:").await.unwrap();
        let job = JobRecord::new("run.mov", "/media/run.mov", PipelineKind::Openpose, Some(24.0));
        store.insert(&job).await.unwrap();

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "run.mov");
        assert_eq!(stored.pipeline_kind, PipelineKind::Openpose);
        assert_eq!(stored.fps, 24.0);
        assert_eq!(stored.created_at.timestamp(), job.created_at.timestamp());
    }
}
