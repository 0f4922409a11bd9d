//! Shared registry of supervised processes, keyed by job id.
//!
//! At most one slot exists per job. The stage chain executor claims the slot
//! for the whole run; the supervisor attaches the handle of the process it is
//! currently driving and detaches it when the stage ends; the cancellation
//! coordinator looks the handle up to stop it. Every access goes through one
//! mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::model::JobId;

/// Why the supervisor is being asked to kill its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// A forced stop was requested.
    Cancelled,
    /// A cooperative stop did not finish in time.
    GraceExpired,
}

/// Sends a kill request to whoever drives the process. The first reason sent
/// sticks.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    tx: Arc<watch::Sender<Option<KillReason>>>,
}

impl KillSwitch {
    pub fn kill(&self, reason: KillReason) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }
}

/// Registry view of one running external process.
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub stage: String,
    kill: KillSwitch,
    exited: watch::Receiver<bool>,
}

/// The supervising side of a [`ProcessHandle`].
#[derive(Debug)]
pub struct ProcessControl {
    pub kill_rx: watch::Receiver<Option<KillReason>>,
    exited_tx: watch::Sender<bool>,
}

impl ProcessControl {
    pub fn mark_exited(&self) {
        self.exited_tx.send_replace(true);
    }
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>, stage: impl Into<String>) -> (Self, ProcessControl) {
        let (kill_tx, kill_rx) = watch::channel(None);
        let (exited_tx, exited_rx) = watch::channel(false);
        let handle = Self {
            pid,
            stage: stage.into(),
            kill: KillSwitch {
                tx: Arc::new(kill_tx),
            },
            exited: exited_rx,
        };
        (handle, ProcessControl { kill_rx, exited_tx })
    }
}

/// What a stop request found for a job.
#[derive(Debug)]
pub enum StopTarget {
    /// Nothing supervises the job in this process.
    NotRunning,
    /// The job is claimed but between processes; the request is remembered.
    Idle,
    Running {
        pid: Option<u32>,
        stage: String,
        kill: KillSwitch,
        exited: watch::Receiver<bool>,
    },
}

/// Result of attaching a process to a job's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    Attached,
    /// A stop arrived before the process was attached.
    StopPending,
}

#[derive(Debug, Default)]
struct Slot {
    handle: Option<ProcessHandle>,
    stop_requested: bool,
    claimed: bool,
}

#[derive(Debug, Default)]
pub struct ProcessRegistry {
    slots: Mutex<HashMap<JobId, Slot>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<JobId, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve `job` for one run. `None` if it is already claimed.
    pub fn claim(self: &Arc<Self>, job: JobId) -> Option<JobClaim> {
        let mut slots = self.slots();
        let slot = slots.entry(job).or_default();
        if slot.claimed {
            return None;
        }
        slot.claimed = true;
        slot.stop_requested = false;
        Some(JobClaim {
            registry: Arc::clone(self),
            job,
        })
    }

    pub fn is_claimed(&self, job: JobId) -> bool {
        self.slots().get(&job).is_some_and(|s| s.claimed)
    }

    pub fn attach(&self, job: JobId, handle: ProcessHandle) -> Attach {
        let mut slots = self.slots();
        let slot = slots.entry(job).or_default();
        slot.handle = Some(handle);
        if slot.stop_requested {
            Attach::StopPending
        } else {
            Attach::Attached
        }
    }

    /// Remove the process handle; drop the slot too unless it is claimed.
    pub fn detach(&self, job: JobId) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(&job) {
            slot.handle = None;
            if !slot.claimed {
                slots.remove(&job);
            }
        }
    }

    pub fn stop_requested(&self, job: JobId) -> bool {
        self.slots().get(&job).is_some_and(|s| s.stop_requested)
    }

    /// Forget a stop request once a stage has consumed it.
    pub fn clear_stop(&self, job: JobId) {
        if let Some(slot) = self.slots().get_mut(&job) {
            slot.stop_requested = false;
        }
    }

    /// Record a stop request and report what it has to act on.
    pub fn request_stop(&self, job: JobId) -> StopTarget {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(&job) else {
            return StopTarget::NotRunning;
        };
        slot.stop_requested = true;
        match &slot.handle {
            Some(handle) => StopTarget::Running {
                pid: handle.pid,
                stage: handle.stage.clone(),
                kill: handle.kill.clone(),
                exited: handle.exited.clone(),
            },
            None => StopTarget::Idle,
        }
    }

    fn release(&self, job: JobId) {
        self.slots().remove(&job);
    }
}

/// Exclusive reservation of a job for one run; released on drop.
#[derive(Debug)]
pub struct JobClaim {
    registry: Arc<ProcessRegistry>,
    job: JobId,
}

impl Drop for JobClaim {
    fn drop(&mut self) {
        self.registry.release(self.job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn claim_is_exclusive_and_released_on_drop() {
        let registry = Arc::new(ProcessRegistry::new());
        let job = Uuid::new_v4();

        let claim = registry.claim(job).expect("first claim");
        assert!(registry.claim(job).is_none());
        assert!(registry.is_claimed(job));
        drop(claim);
        assert!(!registry.is_claimed(job));
        assert!(registry.claim(job).is_some());
    }

    #[test]
    fn stop_without_slot_is_not_running() {
        let registry = ProcessRegistry::new();
        assert!(matches!(registry.request_stop(Uuid::new_v4()), StopTarget::NotRunning));
    }

    #[test]
    fn stop_between_processes_is_remembered() {
        let registry = Arc::new(ProcessRegistry::new());
        let job = Uuid::new_v4();
        let _claim = registry.claim(job).unwrap();

        assert!(matches!(registry.request_stop(job), StopTarget::Idle));
        assert!(registry.stop_requested(job));

        let (handle, _control) = ProcessHandle::new(Some(1), "lift");
        assert_eq!(registry.attach(job, handle), Attach::StopPending);
    }

    #[test]
    fn stop_reaches_attached_process() {
        let registry = Arc::new(ProcessRegistry::new());
        let job = Uuid::new_v4();
        let _claim = registry.claim(job).unwrap();
        let (handle, control) = ProcessHandle::new(Some(77), "detect");
        assert_eq!(registry.attach(job, handle), Attach::Attached);

        let StopTarget::Running { pid, stage, kill, exited } = registry.request_stop(job) else {
            panic!("expected a running target");
        };
        assert_eq!(pid, Some(77));
        assert_eq!(stage, "detect");

        kill.kill(KillReason::GraceExpired);
        kill.kill(KillReason::Cancelled);
        assert_eq!(*control.kill_rx.borrow(), Some(KillReason::GraceExpired));

        control.mark_exited();
        assert!(*exited.borrow());

        registry.detach(job);
        assert!(matches!(registry.request_stop(job), StopTarget::Idle));
    }

    #[test]
    fn unclaimed_slot_disappears_on_detach() {
        let registry = ProcessRegistry::new();
        let job = Uuid::new_v4();
        let (handle, _control) = ProcessHandle::new(None, "x");
        registry.attach(job, handle);
        assert!(matches!(registry.request_stop(job), StopTarget::Running { .. }));
        registry.detach(job);
        assert!(matches!(registry.request_stop(job), StopTarget::NotRunning));
    }
}
