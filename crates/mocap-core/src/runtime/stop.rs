//! Stop signal seen by external tools.
//!
//! Tools that support cooperative stopping poll a flag file in the job's
//! working area. The executor and the cancellation coordinator only talk to
//! [`StopSignal`], so a tool running in-process can be given a real
//! cancellation channel through [`InProcessStop`] instead.

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::model::JobId;
use crate::runtime::workspace::{remove_if_present, Workspace};

pub trait StopSignal: Send + Sync + 'static {
    fn raise(&self, job: JobId) -> io::Result<()>;

    fn is_raised(&self, job: JobId) -> bool;

    fn clear(&self, job: JobId);

    /// Path handed to tools as `{stop_flag}`, if the signal is file based.
    fn flag_path(&self, job: JobId) -> Option<PathBuf>;
}

/// `STOP_FLAG` file in the job's working area.
#[derive(Debug, Clone)]
pub struct FlagFile {
    workspace: Workspace,
}

impl FlagFile {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

impl StopSignal for FlagFile {
    fn raise(&self, job: JobId) -> io::Result<()> {
        self.workspace.ensure(job)?;
        std::fs::write(self.workspace.stop_flag(job), "stop")
    }

    fn is_raised(&self, job: JobId) -> bool {
        self.workspace.stop_flag(job).exists()
    }

    fn clear(&self, job: JobId) {
        remove_if_present(&self.workspace.stop_flag(job));
    }

    fn flag_path(&self, job: JobId) -> Option<PathBuf> {
        Some(self.workspace.stop_flag(job))
    }
}

/// Stop requests held in memory.
#[derive(Debug, Default)]
pub struct InProcessStop {
    raised: Mutex<HashSet<JobId>>,
}

impl InProcessStop {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StopSignal for InProcessStop {
    fn raise(&self, job: JobId) -> io::Result<()> {
        if let Ok(mut raised) = self.raised.lock() {
            raised.insert(job);
        }
        Ok(())
    }

    fn is_raised(&self, job: JobId) -> bool {
        self.raised.lock().map(|r| r.contains(&job)).unwrap_or(false)
    }

    fn clear(&self, job: JobId) {
        if let Ok(mut raised) = self.raised.lock() {
            raised.remove(&job);
        }
    }

    fn flag_path(&self, _job: JobId) -> Option<PathBuf> {
        None
    }
}
