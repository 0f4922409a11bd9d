//! Launches one external tool and drives it to a result.
//!
//! Standard output is parsed line by line into [`ToolEvent`]s while the
//! process runs; standard error is kept as a bounded tail for diagnostics.
//! The process is registered in the [`ProcessRegistry`] for as long as it
//! runs so that a stop request can reach it, and its pid is written to the
//! job's working area so a restarted service can find it again.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{tail_lossy, PipelineError, STDERR_TAIL_BYTES};
use crate::model::JobId;
use crate::pipeline::ProgressFormat;
use crate::runtime::artifact::{resolve_artifact, salvage, SalvageRule};
use crate::runtime::probe::ProcessProbe;
use crate::runtime::protocol::ToolEvent;
use crate::runtime::registry::{Attach, KillReason, ProcessControl, ProcessHandle, ProcessRegistry};
use crate::runtime::stop::StopSignal;
use crate::runtime::throttle::ProgressReporter;
use crate::runtime::workspace::Workspace;

/// How long to keep reading stdout after the process has exited.
const STDOUT_DRAIN: Duration = Duration::from_secs(2);

/// A fully rendered stage invocation.
#[derive(Debug, Clone)]
pub struct StageInvocation {
    pub job: JobId,
    pub stage: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
    /// Default artifact locations, in preference order for ties.
    pub outputs: Vec<PathBuf>,
    pub salvage_extension: Option<String>,
    pub progress_format: ProgressFormat,
    /// Final name of a default-location artifact.
    pub rename_to: Option<PathBuf>,
}

/// Artifact produced by one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutput {
    pub artifact: PathBuf,
    /// The stage was stopped early and this is what it had so far.
    pub partial: bool,
}

#[derive(Debug)]
enum Ending {
    Exited(ExitStatus),
    Killed(KillReason),
    TimedOut,
}

pub struct ProcessSupervisor {
    registry: Arc<ProcessRegistry>,
    stop: Arc<dyn StopSignal>,
    probe: Arc<dyn ProcessProbe>,
    workspace: Workspace,
    kill_wait: Duration,
    cooperative_grace: Duration,
    monitor_poll: Duration,
    min_artifact_bytes: u64,
}

impl ProcessSupervisor {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        stop: Arc<dyn StopSignal>,
        probe: Arc<dyn ProcessProbe>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            stop,
            probe,
            workspace: Workspace::new(&config.media_root),
            kill_wait: config.kill_wait,
            cooperative_grace: config.cooperative_grace,
            monitor_poll: config.monitor_poll,
            min_artifact_bytes: config.min_artifact_bytes,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Run `inv` to completion and classify the result.
    pub async fn run_stage(
        &self,
        inv: &StageInvocation,
        reporter: &mut ProgressReporter,
    ) -> Result<StageOutput, PipelineError> {
        self.workspace.ensure(inv.job)?;

        let mut cmd = Command::new(&inv.program);
        cmd.args(&inv.args)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(flag) = self.stop.flag_path(inv.job) {
            cmd.env("MOCAP_STOP_FLAG", flag);
        }
        match &inv.cwd {
            Some(dir) if dir.is_dir() => {
                cmd.current_dir(dir);
            }
            Some(dir) => debug!(stage = %inv.stage, cwd = %dir.display(), "working directory missing; using inherited"),
            None => {}
        }

        let mut child = cmd.spawn().map_err(|source| PipelineError::ToolLaunch {
            stage: inv.stage.clone(),
            program: inv.program.clone(),
            source,
        })?;

        let pid = child.id();
        if let Some(pid) = pid {
            if let Err(e) = self.workspace.write_pid(inv.job, pid) {
                warn!(job_id = %inv.job, error = %e, "failed to write pid marker");
            }
        }
        info!(job_id = %inv.job, stage = %inv.stage, pid, "stage started");

        let (handle, control) = ProcessHandle::new(pid, inv.stage.clone());
        let attached = self.registry.attach(inv.job, handle);
        let attachment = Attachment::new(&self.registry, &self.workspace, inv.job, control);

        let stderr_task = tokio::spawn(read_tail(child.stderr.take()));
        let mut sink = StdoutSink {
            format: inv.progress_format,
            stage: &inv.stage,
            reporter,
            reported: None,
        };

        let ending = if attached == Attach::StopPending {
            Ending::Killed(KillReason::Cancelled)
        } else {
            drive(&mut child, &attachment.control, &mut sink, inv.timeout).await?
        };

        if !matches!(ending, Ending::Exited(_)) {
            self.terminate(&mut child, inv).await;
        }
        sink.reporter.flush().await;
        let reported = sink.reported.take();
        drop(attachment);

        let stderr_tail = match tokio::time::timeout(STDOUT_DRAIN, stderr_task).await {
            Ok(Ok(bytes)) => tail_lossy(&bytes, STDERR_TAIL_BYTES),
            _ => String::new(),
        };

        let outcome = self.classify(inv, ending, reported, stderr_tail);
        match &outcome {
            Ok(out) => info!(
                job_id = %inv.job,
                stage = %inv.stage,
                artifact = %out.artifact.display(),
                partial = out.partial,
                "stage finished"
            ),
            Err(e) => warn!(job_id = %inv.job, stage = %inv.stage, error = %e, "stage failed"),
        }
        outcome
    }

    fn classify(
        &self,
        inv: &StageInvocation,
        ending: Ending,
        reported: Option<Reported>,
        stderr_tail: String,
    ) -> Result<StageOutput, PipelineError> {
        let stop_raised = self.stop.is_raised(inv.job) || self.registry.stop_requested(inv.job);

        match ending {
            Ending::Exited(status) if status.success() => {
                if let Some(reported) = reported {
                    // A clean DONE stays complete even if a stop arrived late.
                    return Ok(StageOutput {
                        artifact: reported.path,
                        partial: reported.stopped,
                    });
                }
                resolve_artifact(&inv.outputs)
                    .map(|artifact| StageOutput { artifact, partial: stop_raised })
                    .ok_or_else(|| PipelineError::ArtifactMissing { stage: inv.stage.clone() })
            }
            Ending::Exited(status) => {
                let stopping = stop_raised || reported.as_ref().is_some_and(|r| r.stopped);
                if stopping {
                    if let Some(artifact) = self.salvage(inv) {
                        return Ok(StageOutput { artifact, partial: true });
                    }
                }
                Err(PipelineError::ToolExecution {
                    stage: inv.stage.clone(),
                    exit_code: status.code(),
                    stderr_tail,
                })
            }
            Ending::Killed(reason) => {
                if let Some(artifact) = self.salvage(inv) {
                    return Ok(StageOutput { artifact, partial: true });
                }
                Err(match reason {
                    KillReason::Cancelled => PipelineError::Stopped { stage: inv.stage.clone() },
                    KillReason::GraceExpired => PipelineError::CancellationTimeout {
                        grace: self.cooperative_grace,
                    },
                })
            }
            Ending::TimedOut => Err(PipelineError::ToolTimeout {
                stage: inv.stage.clone(),
                timeout: inv.timeout,
            }),
        }
    }

    /// Watch a process left behind by a previous service instance until it
    /// exits, then classify the stage from what is on disk.
    ///
    /// Its output stream is gone, so progress is not reported. Stop requests
    /// reach it through the registry like any other process and are carried
    /// out with the probe.
    pub async fn adopt(&self, inv: &StageInvocation, pid: u32) -> Result<StageOutput, PipelineError> {
        info!(job_id = %inv.job, stage = %inv.stage, pid, "monitoring re-attached process");
        let (handle, control) = ProcessHandle::new(Some(pid), inv.stage.clone());
        let attached = self.registry.attach(inv.job, handle);
        let attachment = Attachment::new(&self.registry, &self.workspace, inv.job, control);

        let mut killed = None;
        if attached == Attach::StopPending {
            killed = Some(KillReason::Cancelled);
            self.probe.kill(pid);
        }
        let mut kill_rx = attachment.control.kill_rx.clone();
        let mut kill_open = killed.is_none();
        let mut ticker = tokio::time::interval(self.monitor_poll);

        while self.probe.is_alive(pid) {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = kill_rx.changed(), if kill_open => match changed {
                    Ok(()) => {
                        if let Some(reason) = *kill_rx.borrow_and_update() {
                            warn!(job_id = %inv.job, pid, ?reason, "killing re-attached process");
                            self.probe.kill(pid);
                            killed = Some(reason);
                            kill_open = false;
                        }
                    }
                    Err(_) => kill_open = false,
                },
            }
        }
        drop(attachment);
        info!(job_id = %inv.job, stage = %inv.stage, pid, "re-attached process exited");

        let stop_raised = self.stop.is_raised(inv.job) || self.registry.stop_requested(inv.job);
        if let Some(artifact) = self.salvage(inv) {
            let partial = killed.is_some() || stop_raised;
            return Ok(StageOutput { artifact, partial });
        }
        Err(match killed {
            Some(KillReason::Cancelled) => PipelineError::Stopped { stage: inv.stage.clone() },
            Some(KillReason::GraceExpired) => PipelineError::CancellationTimeout {
                grace: self.cooperative_grace,
            },
            None => PipelineError::OrphanRecovery,
        })
    }

    fn salvage(&self, inv: &StageInvocation) -> Option<PathBuf> {
        let rule = SalvageRule {
            candidates: &inv.outputs,
            extension: inv.salvage_extension.as_deref(),
            min_bytes: self.min_artifact_bytes,
        };
        salvage(&self.workspace.job_dir(inv.job), &rule)
    }

    async fn terminate(&self, child: &mut Child, inv: &StageInvocation) {
        if let Err(e) = child.start_kill() {
            debug!(stage = %inv.stage, error = %e, "kill failed; process already gone");
        }
        if tokio::time::timeout(self.kill_wait, child.wait()).await.is_err() {
            warn!(job_id = %inv.job, stage = %inv.stage, "killed process was not reaped in time");
        }
    }
}

/// Read stdout and wait for whichever comes first: exit, kill request or
/// timeout.
async fn drive(
    child: &mut Child,
    control: &ProcessControl,
    sink: &mut StdoutSink<'_>,
    timeout: Duration,
) -> Result<Ending, PipelineError> {
    let mut reader = child.stdout.take().map(BufReader::new);
    let mut buf = Vec::new();
    let mut kill_rx = control.kill_rx.clone();
    let mut kill_open = true;
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let ending = loop {
        tokio::select! {
            read = read_line(&mut reader, &mut buf) => match read {
                Some(line) => sink.consume(&line).await,
                None => reader = None,
            },
            status = child.wait() => break Ending::Exited(status?),
            changed = kill_rx.changed(), if kill_open => match changed {
                Ok(()) => {
                    if let Some(reason) = *kill_rx.borrow_and_update() {
                        break Ending::Killed(reason);
                    }
                }
                Err(_) => kill_open = false,
            },
            () = &mut deadline => break Ending::TimedOut,
        }
    };

    if matches!(ending, Ending::Exited(_)) {
        // Lines written right before exit may still be buffered in the pipe.
        while reader.is_some() {
            match tokio::time::timeout(STDOUT_DRAIN, read_line(&mut reader, &mut buf)).await {
                Ok(Some(line)) => sink.consume(&line).await,
                _ => break,
            }
        }
    }
    Ok(ending)
}

/// Next line from `reader`, or `None` at end of stream. Pends forever once
/// the stream is gone so the branch goes quiet inside `select!`.
async fn read_line<R: AsyncBufReadExt + Unpin>(
    reader: &mut Option<R>,
    buf: &mut Vec<u8>,
) -> Option<String> {
    let Some(inner) = reader.as_mut() else {
        return std::future::pending().await;
    };
    match inner.read_until(b'\n', buf).await {
        Ok(0) => None,
        Ok(_) => {
            let line = String::from_utf8_lossy(buf).into_owned();
            buf.clear();
            Some(line)
        }
        Err(e) => {
            debug!(error = %e, "stdout read failed");
            None
        }
    }
}

#[derive(Debug)]
struct Reported {
    path: PathBuf,
    stopped: bool,
}

struct StdoutSink<'a> {
    format: ProgressFormat,
    stage: &'a str,
    reporter: &'a mut ProgressReporter,
    reported: Option<Reported>,
}

impl StdoutSink<'_> {
    async fn consume(&mut self, raw: &str) {
        match ToolEvent::parse(raw, self.format) {
            ToolEvent::Done(path) => self.reported = Some(Reported { path, stopped: false }),
            ToolEvent::Stopped(path) => self.reported = Some(Reported { path, stopped: true }),
            ToolEvent::Other(text) => {
                if !text.is_empty() {
                    debug!(stage = %self.stage, line = %text, "tool output");
                }
            }
            event => self.reporter.observe(&event).await,
        }
    }
}

/// Keeps a process visible in the registry while it runs.
struct Attachment<'a> {
    registry: &'a ProcessRegistry,
    workspace: &'a Workspace,
    job: JobId,
    control: ProcessControl,
}

impl<'a> Attachment<'a> {
    fn new(
        registry: &'a ProcessRegistry,
        workspace: &'a Workspace,
        job: JobId,
        control: ProcessControl,
    ) -> Self {
        Self { registry, workspace, job, control }
    }
}

impl Drop for Attachment<'_> {
    fn drop(&mut self) {
        self.control.mark_exited();
        self.registry.detach(self.job);
        self.workspace.clear_pid(self.job);
    }
}

/// Read a stream to the end, keeping only its last bytes.
async fn read_tail<R: AsyncRead + Unpin>(stream: Option<R>) -> Vec<u8> {
    let mut tail = Vec::new();
    let Some(mut stream) = stream else {
        return tail;
    };
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > 2 * STDERR_TAIL_BYTES {
                    tail.drain(..tail.len() - STDERR_TAIL_BYTES);
                }
            }
        }
    }
    tail
}
