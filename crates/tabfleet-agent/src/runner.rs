use std::{collections::BTreeMap, fmt, path::Path, process::Stdio, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    sync::watch,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ring_buffer::RingBuffer;

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// `None` when the process was terminated by a signal.
    Exited(Option<i32>),
    WaitFailed(String),
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(Some(0)))
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(Some(code)) => write!(f, "exit status {code}"),
            Self::Exited(None) => f.write_str("terminated by signal"),
            Self::WaitFailed(e) => write!(f, "wait failed: {e}"),
        }
    }
}

/// Handle to a started worker.
#[async_trait]
pub trait Cmd: Send + Sync {
    /// Resolves once the process has exited. Safe to call repeatedly and
    /// from several tasks.
    async fn wait(&self) -> ProcessExit;

    fn pid(&self) -> Option<u32>;

    /// Whether the exit has already been observed.
    fn exited(&self) -> bool;

    /// Asks the runner to hard-stop the process. Never blocks.
    fn cancel(&self);
}

pub trait ProcessRunner: Send + Sync {
    /// Starts `binary` with exactly `env`, copying stdout and stderr into
    /// `output`.
    fn run(
        &self,
        binary: &Path,
        env: &[(String, String)],
        output: Arc<RingBuffer>,
    ) -> anyhow::Result<Arc<dyn Cmd>>;

    fn is_port_available(&self, port: u16) -> bool;
}

/// Spawns real OS processes, each in its own session.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRunner;

pub struct LocalCmd {
    pid: Option<u32>,
    cancel: CancellationToken,
    exit: watch::Receiver<Option<ProcessExit>>,
}

#[async_trait]
impl Cmd for LocalCmd {
    async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit.clone();
        let res = rx.wait_for(Option::is_some).await.map(|v| (*v).clone());
        match res {
            Ok(Some(exit)) => exit,
            Ok(None) => ProcessExit::WaitFailed("exit status missing".to_string()),
            Err(_) => ProcessExit::WaitFailed("process watcher dropped".to_string()),
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

fn pipe_into<R>(mut reader: R, sink: Arc<RingBuffer>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink.write(&buf[..n]),
            }
        }
    });
}

impl ProcessRunner for LocalRunner {
    fn run(
        &self,
        binary: &Path,
        env: &[(String, String)],
        output: Arc<RingBuffer>,
    ) -> anyhow::Result<Arc<dyn Cmd>> {
        let mut cmd = Command::new(binary);
        cmd.env_clear()
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    crate::platform::set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("start worker {}", binary.display()))?;
        let pid = child.id();
        debug!(?pid, binary = %binary.display(), "worker spawned");

        if let Some(out) = child.stdout.take() {
            pipe_into(out, output.clone());
        }
        if let Some(err) = child.stderr.take() {
            pipe_into(err, output);
        }

        let (tx, rx) = watch::channel(None);
        let token = CancellationToken::new();
        let cancelled = token.clone();
        tokio::spawn(async move {
            let first = tokio::select! {
                res = child.wait() => Some(res),
                _ = cancelled.cancelled() => None,
            };
            let res = match first {
                Some(res) => res,
                None => {
                    if let Err(e) = child.start_kill() {
                        warn!(?pid, error = %e, "cancel: kill failed");
                    }
                    child.wait().await
                }
            };
            let exit = match res {
                Ok(status) => ProcessExit::Exited(status.code()),
                Err(e) => ProcessExit::WaitFailed(e.to_string()),
            };
            debug!(?pid, %exit, "worker exited");
            let _ = tx.send(Some(exit));
        });

        Ok(Arc::new(LocalCmd {
            pid,
            cancel: token,
            exit: rx,
        }))
    }

    fn is_port_available(&self, port: u16) -> bool {
        crate::port_alloc::is_port_available(port)
    }
}

/// The orchestrator's own environment, minus variables that are not valid
/// UTF-8.
pub fn inherited_env() -> Vec<(String, String)> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

/// Drops every base entry whose key is overridden, then appends the
/// overrides in key order.
pub fn merge_env_with_overrides(
    base: impl IntoIterator<Item = (String, String)>,
    overrides: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = base
        .into_iter()
        .filter(|(k, _)| !overrides.contains_key(k))
        .collect();
    out.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    out
}
