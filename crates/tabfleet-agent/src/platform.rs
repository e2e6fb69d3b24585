//! OS process-group signalling and liveness checks.
//!
//! Workers are started as session leaders, so their pid doubles as the
//! process-group id and a group signal reaches every helper they spawn.

use std::{io, time::Duration};

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

impl Signal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Terminate => "SIGTERM",
            Self::Kill => "SIGKILL",
        }
    }
}

pub trait ProcessControl: Send + Sync {
    /// Signals the whole process group led by `pid`.
    fn signal_group(&self, pid: u32, signal: Signal) -> io::Result<()>;

    /// True while the OS still knows a process with this pid.
    fn is_alive(&self, pid: u32) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessControl;

#[cfg(unix)]
fn checked_pid(pid: u32) -> io::Result<libc::pid_t> {
    match libc::pid_t::try_from(pid) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {pid}"),
        )),
    }
}

#[cfg(unix)]
impl ProcessControl for OsProcessControl {
    fn signal_group(&self, pid: u32, signal: Signal) -> io::Result<()> {
        let pgid = checked_pid(pid)?;
        let sig = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        let rc = unsafe { libc::kill(-pgid, sig) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            // Group already gone.
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = checked_pid(pid) else {
            return false;
        };
        let rc = unsafe { libc::kill(pid, 0) };
        if rc == 0 {
            return true;
        }
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

// No process groups here: taskkill /T walks the child tree instead, and a
// terminate request is as forceful as the platform allows without /F.
#[cfg(not(unix))]
impl ProcessControl for OsProcessControl {
    fn signal_group(&self, pid: u32, signal: Signal) -> io::Result<()> {
        if pid == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "refusing to signal pid 0",
            ));
        }
        let pid_arg = pid.to_string();
        let mut args = vec!["/PID", pid_arg.as_str(), "/T"];
        if signal == Signal::Kill {
            args.push("/F");
        }
        let status = std::process::Command::new("taskkill")
            .args(&args)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()?;
        if status.success() || !self.is_alive(pid) {
            return Ok(());
        }
        Err(io::Error::other(format!("taskkill exited with {status}")))
    }

    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        let filter = format!("PID eq {pid}");
        match std::process::Command::new("tasklist")
            .args(["/FI", filter.as_str(), "/NH"])
            .output()
        {
            Ok(out) => String::from_utf8_lossy(&out.stdout)
                .split_whitespace()
                .any(|tok| tok == pid.to_string()),
            Err(_) => false,
        }
    }
}

/// Polls until `pid` disappears. Returns false if it is still alive once
/// `timeout` has passed.
pub async fn wait_for_exit(
    control: &dyn ProcessControl,
    pid: u32,
    timeout: Duration,
    poll: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !control.is_alive(pid) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(poll.min(deadline - now)).await;
    }
}

#[cfg(target_os = "linux")]
pub(crate) unsafe fn set_parent_death_signal() -> io::Result<()> {
    // `unsafe fn` bodies are not implicitly unsafe in Rust 2024.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) unsafe fn set_parent_death_signal() -> io::Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(OsProcessControl.is_alive(std::process::id()));
        assert!(!OsProcessControl.is_alive(0));
    }

    #[test]
    fn refuses_pid_zero() {
        let err = OsProcessControl
            .signal_group(0, Signal::Terminate)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn wait_for_exit_reports_timeout_for_live_pid() {
        let pid = std::process::id();
        let gone = wait_for_exit(
            &OsProcessControl,
            pid,
            Duration::from_millis(60),
            Duration::from_millis(20),
        )
        .await;
        assert!(!gone);
    }

    #[tokio::test]
    async fn group_kill_takes_down_session_leader() {
        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.args(["-c", "sleep 30"]);
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();
        assert!(OsProcessControl.is_alive(pid));

        OsProcessControl.signal_group(pid, Signal::Kill).unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
        assert!(
            wait_for_exit(
                &OsProcessControl,
                pid,
                Duration::from_secs(2),
                Duration::from_millis(20)
            )
            .await
        );
    }
}
