//! Stop escalation for a single worker.
//!
//! Steps run strictly in order and each waits out its own polling window
//! before the next, stronger one:
//! shutdown request, grace period, SIGTERM to the group, SIGKILL to the
//! group plus `Cmd::cancel`.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::{
    config::StopTimings,
    platform::{ProcessControl, Signal, wait_for_exit},
    runner::Cmd,
};

/// The step that confirmed the process was gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStep {
    NoProcess,
    Graceful,
    Terminated,
    Killed,
}

impl StopStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoProcess => "no_process",
            Self::Graceful => "graceful",
            Self::Terminated => "terminated",
            Self::Killed => "killed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to stop process {pid}; still running")]
pub struct StillRunning {
    pub pid: u32,
}

async fn request_shutdown(client: &reqwest::Client, base_url: &str, timeout: Duration) {
    let url = format!("{}/shutdown", base_url.trim_end_matches('/'));
    match client.post(&url).timeout(timeout).send().await {
        Ok(resp) => debug!(%url, status = resp.status().as_u16(), "stop: shutdown requested"),
        Err(e) => debug!(%url, error = %e, "stop: shutdown request failed"),
    }
}

pub async fn terminate(
    client: &reqwest::Client,
    control: &dyn ProcessControl,
    cmd: &dyn Cmd,
    base_url: &str,
    timings: &StopTimings,
) -> Result<StopStep, StillRunning> {
    let Some(pid) = cmd.pid() else {
        cmd.cancel();
        return Ok(StopStep::NoProcess);
    };
    let poll = timings.poll_interval;

    request_shutdown(client, base_url, timings.shutdown_request).await;
    if wait_for_exit(control, pid, timings.graceful_wait, poll).await {
        return Ok(StopStep::Graceful);
    }

    info!(pid, "stop: sending SIGTERM to process group");
    if let Err(e) = control.signal_group(pid, Signal::Terminate) {
        warn!(pid, error = %e, "stop: SIGTERM failed");
    }
    if wait_for_exit(control, pid, timings.term_wait, poll).await {
        return Ok(StopStep::Terminated);
    }

    warn!(pid, "stop: escalating to SIGKILL");
    if let Err(e) = control.signal_group(pid, Signal::Kill) {
        warn!(pid, error = %e, "stop: SIGKILL failed");
    }
    cmd.cancel();
    if wait_for_exit(control, pid, timings.kill_wait, poll).await {
        return Ok(StopStep::Killed);
    }

    error!(pid, "stop: process still running after SIGKILL");
    Err(StillRunning { pid })
}
