//! Rate-limited progress persistence.
//!
//! Tools may print `PROGRESS:` for every frame. [`ProgressThrottle`] lets at
//! most one write per interval through and keeps the most recent suppressed
//! update so it can be flushed when the stage ends. Terminal status writes
//! never go through here.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::model::JobId;
use crate::pipeline::scale_into;
use crate::runtime::protocol::ToolEvent;
use crate::store::JobStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub progress: u8,
    pub detail: String,
}

#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last_write: Option<Instant>,
    pending: Option<ProgressUpdate>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_write: None,
            pending: None,
        }
    }

    /// Returns the update if it may be written now, otherwise holds it.
    pub fn offer(&mut self, now: Instant, update: ProgressUpdate) -> Option<ProgressUpdate> {
        let due = self
            .last_write
            .is_none_or(|last| now.duration_since(last) >= self.interval);
        if due {
            self.last_write = Some(now);
            self.pending = None;
            Some(update)
        } else {
            self.pending = Some(update);
            None
        }
    }

    /// The newest update that was held back, if any.
    pub fn take_pending(&mut self) -> Option<ProgressUpdate> {
        self.pending.take()
    }
}

/// Turns `TOTAL`/`PROGRESS` events of one stage into throttled store writes.
pub struct ProgressReporter {
    store: Arc<dyn JobStore>,
    job: JobId,
    run: i64,
    band: (u8, u8),
    label: Option<String>,
    throttle: ProgressThrottle,
    started: Instant,
}

impl ProgressReporter {
    pub fn new(
        store: Arc<dyn JobStore>,
        job: JobId,
        run: i64,
        band: (u8, u8),
        interval: Duration,
    ) -> Self {
        Self {
            store,
            job,
            run,
            band,
            label: None,
            throttle: ProgressThrottle::new(interval),
            started: Instant::now(),
        }
    }

    /// Prefix for detail text, e.g. `"3D estimation"`.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    fn detail(&self, text: String) -> String {
        match &self.label {
            Some(label) => format!("{label}: {text}"),
            None => text,
        }
    }

    pub async fn observe(&mut self, event: &ToolEvent) {
        let now = Instant::now();
        let update = match *event {
            ToolEvent::Total(total) => ProgressUpdate {
                progress: self.band.0,
                detail: self.detail(format!("0 / {total} frames")),
            },
            ToolEvent::Progress { current, total } if total > 0 && current > 0 => {
                let elapsed = now.duration_since(self.started).as_secs_f64().max(0.1);
                let fps = current as f64 / elapsed;
                let remaining = (total.saturating_sub(current) as f64 / fps.max(0.01)) as u64;
                ProgressUpdate {
                    progress: scale_into(self.band, current, total),
                    detail: self.detail(format!(
                        "{current} / {total} frames, {fps:.1} fps, ~{remaining}s left"
                    )),
                }
            }
            _ => return,
        };
        if let Some(update) = self.throttle.offer(now, update) {
            self.write(update).await;
        }
    }

    /// Write whatever the throttle held back.
    pub async fn flush(&mut self) {
        if let Some(update) = self.throttle.take_pending() {
            self.write(update).await;
        }
    }

    async fn write(&self, update: ProgressUpdate) {
        if let Err(e) = self
            .store
            .update_progress(self.job, self.run, update.progress, &update.detail)
            .await
        {
            warn!(job_id = %self.job, error = %e, "failed to persist progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobRecord, JobStatus, PipelineKind};
    use crate::store::memory::MemoryJobStore;

    fn update(progress: u8) -> ProgressUpdate {
        ProgressUpdate {
            progress,
            detail: format!("{progress}%"),
        }
    }

    #[test]
    fn throttle_lets_one_write_per_interval() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(1));
        let t0 = Instant::now();

        assert_eq!(throttle.offer(t0, update(1)), Some(update(1)));
        assert_eq!(throttle.offer(t0 + Duration::from_millis(200), update(2)), None);
        assert_eq!(throttle.offer(t0 + Duration::from_millis(900), update(3)), None);
        assert_eq!(throttle.offer(t0 + Duration::from_millis(1000), update(4)), Some(update(4)));
        assert_eq!(throttle.take_pending(), None);
    }

    #[test]
    fn throttle_keeps_latest_suppressed_update() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(1));
        let t0 = Instant::now();
        throttle.offer(t0, update(1));
        throttle.offer(t0, update(2));
        throttle.offer(t0, update(3));
        assert_eq!(throttle.take_pending(), Some(update(3)));
        assert_eq!(throttle.take_pending(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_coalesces_and_flushes() {
        let store = Arc::new(MemoryJobStore::new());
        let job = JobRecord::new("a.mp4", "/a.mp4", PipelineKind::Mediapipe, None);
        store.insert(&job).await.unwrap();
        store.enter_stage(job.id, 0, JobStatus::Detecting, 0, "").await.unwrap();

        let mut reporter =
            ProgressReporter::new(store.clone(), job.id, 0, (0, 45), Duration::from_secs(1));

        reporter.observe(&ToolEvent::Total(100)).await;
        assert_eq!(store.get(job.id).await.unwrap().unwrap().progress_detail, "0 / 100 frames");

        for current in 1..=50 {
            reporter.observe(&ToolEvent::Progress { current, total: 100 }).await;
        }
        // Still inside the first interval.
        assert_eq!(store.get(job.id).await.unwrap().unwrap().progress, 0);

        reporter.flush().await;
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, 22);
        assert!(stored.progress_detail.starts_with("50 / 100 frames, "));
        assert!(stored.progress_detail.ends_with("s left"));
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_writes_again_after_interval() {
        let store = Arc::new(MemoryJobStore::new());
        let job = JobRecord::new("a.mp4", "/a.mp4", PipelineKind::Mediapipe, None);
        store.insert(&job).await.unwrap();

        let mut reporter =
            ProgressReporter::new(store.clone(), job.id, 0, (50, 98), Duration::from_secs(1))
                .with_label("3D estimation");
        reporter.observe(&ToolEvent::Progress { current: 1, total: 4 }).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        reporter.observe(&ToolEvent::Progress { current: 4, total: 4 }).await;

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, 98);
        assert!(stored.progress_detail.starts_with("3D estimation: 4 / 4 frames"));
    }

    #[tokio::test]
    async fn reporter_ignores_other_events() {
        let store = Arc::new(MemoryJobStore::new());
        let job = JobRecord::new("a.mp4", "/a.mp4", PipelineKind::V4, None);
        store.insert(&job).await.unwrap();

        let mut reporter =
            ProgressReporter::new(store.clone(), job.id, 0, (0, 98), Duration::from_secs(1));
        reporter.observe(&ToolEvent::Other("warming up".into())).await;
        reporter.observe(&ToolEvent::Progress { current: 0, total: 10 }).await;
        reporter.flush().await;

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored, job);
    }
}
