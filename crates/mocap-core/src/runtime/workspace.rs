//! Per-job working area on disk.
//!
//! ```text
//! <media_root>/output/<job_id>/
//!     STOP_FLAG       cooperative stop request
//!     pipeline.pid    pid of the running stage's tool
//!     ...             stage artifacts
//! ```

use std::io;
use std::path::{Path, PathBuf};

use crate::model::JobId;

pub const STOP_FLAG_FILE: &str = "STOP_FLAG";
pub const PID_MARKER_FILE: &str = "pipeline.pid";

#[derive(Debug, Clone)]
pub struct Workspace {
    media_root: PathBuf,
}

impl Workspace {
    pub fn new(media_root: impl Into<PathBuf>) -> Self {
        Self {
            media_root: media_root.into(),
        }
    }

    pub fn job_dir(&self, id: JobId) -> PathBuf {
        self.media_root.join("output").join(id.to_string())
    }

    pub fn stop_flag(&self, id: JobId) -> PathBuf {
        self.job_dir(id).join(STOP_FLAG_FILE)
    }

    pub fn pid_marker(&self, id: JobId) -> PathBuf {
        self.job_dir(id).join(PID_MARKER_FILE)
    }

    pub fn ensure(&self, id: JobId) -> io::Result<PathBuf> {
        let dir = self.job_dir(id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn write_pid(&self, id: JobId, pid: u32) -> io::Result<()> {
        std::fs::write(self.pid_marker(id), format!("{pid}\n"))
    }

    /// The recorded pid, if the marker exists and parses.
    pub fn read_pid(&self, id: JobId) -> Option<u32> {
        std::fs::read_to_string(self.pid_marker(id))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn clear_pid(&self, id: JobId) {
        remove_if_present(&self.pid_marker(id));
    }

    /// Delete the whole working area.
    pub fn remove(&self, id: JobId) -> io::Result<()> {
        match std::fs::remove_dir_all(self.job_dir(id)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

pub(crate) fn remove_if_present(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn pid_marker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let id = Uuid::new_v4();

        assert_eq!(ws.read_pid(id), None);
        ws.ensure(id).unwrap();
        ws.write_pid(id, 4242).unwrap();
        assert_eq!(ws.read_pid(id), Some(4242));
        ws.clear_pid(id);
        assert_eq!(ws.read_pid(id), None);
        // Clearing twice is fine.
        ws.clear_pid(id);
    }

    #[test]
    fn remove_tolerates_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let id = Uuid::new_v4();
        ws.remove(id).unwrap();
        ws.ensure(id).unwrap();
        std::fs::write(ws.job_dir(id).join("a.csv"), "x").unwrap();
        ws.remove(id).unwrap();
        assert!(!ws.job_dir(id).exists());
    }
}
