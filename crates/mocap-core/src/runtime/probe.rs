//! Host probes: liveness of processes this service did not spawn, and the
//! frame rate of a media file.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tokio::process::Command;
use tracing::debug;

const FFPROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Looks at processes by pid. Used for tools that survived a service restart.
pub trait ProcessProbe: Send + Sync + 'static {
    fn is_alive(&self, pid: u32) -> bool;

    /// Returns `true` if a kill signal was delivered.
    fn kill(&self, pid: u32) -> bool;
}

/// [`ProcessProbe`] backed by `sysinfo`.
#[derive(Debug)]
pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn with_process<T>(&self, pid: u32, f: impl FnOnce(Option<&sysinfo::Process>) -> T) -> T {
        let pid = Pid::from_u32(pid);
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        f(system.process(pid))
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.with_process(pid, |process| {
            process.is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
        })
    }

    fn kill(&self, pid: u32) -> bool {
        self.with_process(pid, |process| process.is_some_and(|p| p.kill()))
    }
}

/// Reads the frame rate of the first video stream of a media file.
#[async_trait]
pub trait FrameRateProbe: Send + Sync + 'static {
    async fn frame_rate(&self, media: &Path) -> Option<f64>;
}

/// [`FrameRateProbe`] that shells out to `ffprobe`.
#[derive(Debug, Clone)]
pub struct Ffprobe {
    program: String,
}

impl Ffprobe {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl FrameRateProbe for Ffprobe {
    async fn frame_rate(&self, media: &Path) -> Option<f64> {
        let mut cmd = Command::new(&self.program);
        cmd.args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=r_frame_rate",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(media)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

        let output = match tokio::time::timeout(FFPROBE_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => output,
            Ok(Ok(output)) => {
                debug!(media = %media.display(), status = %output.status, "ffprobe failed");
                return None;
            }
            Ok(Err(e)) => {
                debug!(media = %media.display(), error = %e, "ffprobe could not be started");
                return None;
            }
            Err(_) => {
                debug!(media = %media.display(), "ffprobe timed out");
                return None;
            }
        };
        parse_frame_rate(&String::from_utf8_lossy(&output.stdout))
    }
}

/// `"30000/1001"` or `"25"`. Zero or non-finite rates are rejected.
pub fn parse_frame_rate(raw: &str) -> Option<f64> {
    let raw = raw.lines().next()?.trim();
    let rate = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rate_parsing() {
        assert_eq!(parse_frame_rate("25/1\n"), Some(25.0));
        let ntsc = parse_frame_rate("30000/1001").unwrap();
        assert!((ntsc - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("24"), Some(24.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("N/A"), None);
        assert_eq!(parse_frame_rate(""), None);
    }

    #[test]
    fn own_process_is_alive() {
        let probe = SystemProbe::new();
        assert!(probe.is_alive(std::process::id()));
    }

    #[tokio::test]
    async fn missing_ffprobe_yields_none() {
        let probe = Ffprobe::new("/nonexistent/ffprobe");
        assert_eq!(probe.frame_rate(Path::new("/tmp/x.mp4")).await, None);
    }
}
