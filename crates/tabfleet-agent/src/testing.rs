//! In-process fakes for exercising the orchestrator without real workers.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::{HashMap, HashSet},
    io,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Json, Router,
    http::{HeaderMap, Method, Uri},
    routing::get,
};
use tabfleet_process::{Instance, InstanceId, InstanceStatus, RemoteTab};
use tokio::sync::watch;

use crate::{
    config::{OrchestratorConfig, StopTimings},
    platform::{ProcessControl, Signal},
    registry::Orchestrator,
    ring_buffer::RingBuffer,
    runner::{Cmd, ProcessExit, ProcessRunner},
};

struct FakeProc {
    alive: bool,
    /// Weakest signal that kills the process; `None` survives everything.
    dies_on: Option<Signal>,
    exit: watch::Sender<Option<ProcessExit>>,
}

#[derive(Default)]
struct FakeState {
    next_pid: u32,
    procs: HashMap<u32, FakeProc>,
    signals: Vec<(u32, Signal)>,
    cancelled: HashSet<u32>,
}

impl FakeState {
    fn kill(&mut self, pid: u32, code: Option<i32>) {
        if let Some(p) = self.procs.get_mut(&pid)
            && p.alive
        {
            p.alive = false;
            p.exit.send_replace(Some(ProcessExit::Exited(code)));
        }
    }
}

/// Process table whose liveness is driven by the test.
#[derive(Default, Clone)]
pub struct FakeProcessControl {
    state: Arc<Mutex<FakeState>>,
}

impl FakeProcessControl {
    pub fn spawn_cmd(&self, dies_on: Option<Signal>) -> Arc<FakeCmd> {
        let mut state = self.state.lock().unwrap();
        state.next_pid += 1;
        let pid = 40_000 + state.next_pid;
        let (tx, rx) = watch::channel(None);
        state.procs.insert(
            pid,
            FakeProc {
                alive: true,
                dies_on,
                exit: tx,
            },
        );
        Arc::new(FakeCmd {
            pid,
            state: self.state.clone(),
            exit: rx,
        })
    }

    /// Simulates the process exiting on its own.
    pub fn exit(&self, pid: u32, code: Option<i32>) {
        self.state.lock().unwrap().kill(pid, code);
    }

    /// Process disappears without the exit ever being observed.
    pub fn vanish(&self, pid: u32) {
        if let Some(p) = self.state.lock().unwrap().procs.get_mut(&pid) {
            p.alive = false;
        }
    }

    /// Marks `pid` alive again without touching its recorded exit, as when
    /// the OS hands the pid to an unrelated process.
    pub fn revive(&self, pid: u32) {
        if let Some(p) = self.state.lock().unwrap().procs.get_mut(&pid) {
            p.alive = true;
        }
    }

    pub fn signals(&self) -> Vec<(u32, Signal)> {
        self.state.lock().unwrap().signals.clone()
    }

    pub fn was_cancelled(&self, pid: u32) -> bool {
        self.state.lock().unwrap().cancelled.contains(&pid)
    }
}

impl ProcessControl for FakeProcessControl {
    fn signal_group(&self, pid: u32, signal: Signal) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.signals.push((pid, signal));
        let dies = match state.procs.get(&pid) {
            Some(p) => match (p.dies_on, signal) {
                (Some(Signal::Terminate), _) => true,
                (Some(Signal::Kill), Signal::Kill) => true,
                _ => false,
            },
            None => false,
        };
        if dies {
            state.kill(pid, None);
        }
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        let state = self.state.lock().unwrap();
        state.procs.get(&pid).is_some_and(|p| p.alive)
    }
}

pub struct FakeCmd {
    pid: u32,
    state: Arc<Mutex<FakeState>>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

#[async_trait]
impl Cmd for FakeCmd {
    async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit.clone();
        let res = rx.wait_for(Option::is_some).await.map(|v| (*v).clone());
        match res {
            Ok(Some(exit)) => exit,
            _ => ProcessExit::WaitFailed("fake exit channel closed".to_string()),
        }
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    fn cancel(&self) {
        self.state.lock().unwrap().cancelled.insert(self.pid);
    }
}

#[derive(Debug, Clone)]
pub struct FakeLaunch {
    pub pid: u32,
    pub env: Vec<(String, String)>,
}

impl FakeLaunch {
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub struct FakeRunner {
    pub control: FakeProcessControl,
    dies_on: Mutex<Option<Signal>>,
    fail_start: AtomicBool,
    port_available: AtomicBool,
    launches: Mutex<Vec<FakeLaunch>>,
}

impl FakeRunner {
    pub fn new(control: FakeProcessControl) -> Self {
        Self {
            control,
            dies_on: Mutex::new(Some(Signal::Terminate)),
            fail_start: AtomicBool::new(false),
            port_available: AtomicBool::new(true),
            launches: Mutex::new(Vec::new()),
        }
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn set_port_available(&self, available: bool) {
        self.port_available.store(available, Ordering::SeqCst);
    }

    pub fn set_dies_on(&self, dies_on: Option<Signal>) {
        *self.dies_on.lock().unwrap() = dies_on;
    }

    pub fn launches(&self) -> Vec<FakeLaunch> {
        self.launches.lock().unwrap().clone()
    }

    pub fn last_pid(&self) -> u32 {
        self.launches.lock().unwrap().last().map(|l| l.pid).unwrap()
    }
}

impl ProcessRunner for FakeRunner {
    fn run(
        &self,
        _binary: &Path,
        env: &[(String, String)],
        output: Arc<RingBuffer>,
    ) -> anyhow::Result<Arc<dyn Cmd>> {
        if self.fail_start.load(Ordering::SeqCst) {
            anyhow::bail!("exec: no such file or directory");
        }
        let dies_on = *self.dies_on.lock().unwrap();
        let cmd = self.control.spawn_cmd(dies_on);
        output.write(b"fake worker booting\n");
        self.launches.lock().unwrap().push(FakeLaunch {
            pid: cmd.pid,
            env: env.to_vec(),
        });
        Ok(cmd)
    }

    fn is_port_available(&self, _port: u16) -> bool {
        self.port_available.load(Ordering::SeqCst)
    }
}

pub fn fast_stop_timings() -> StopTimings {
    StopTimings {
        shutdown_request: Duration::from_millis(200),
        graceful_wait: Duration::from_millis(100),
        term_wait: Duration::from_millis(100),
        kill_wait: Duration::from_millis(100),
        poll_interval: Duration::from_millis(10),
    }
}

pub fn test_config(base_dir: &Path) -> OrchestratorConfig {
    let mut cfg = OrchestratorConfig::new(base_dir, "fake-worker");
    cfg.startup_timeout = Duration::from_secs(30);
    cfg.health_poll_interval = Duration::from_millis(20);
    cfg.health_check_timeout = Duration::from_millis(500);
    cfg.stop = fast_stop_timings();
    cfg
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub runner: Arc<FakeRunner>,
    pub control: FakeProcessControl,
}

pub fn harness_with(config: OrchestratorConfig) -> Harness {
    let control = FakeProcessControl::default();
    let runner = Arc::new(FakeRunner::new(control.clone()));
    let orchestrator =
        Orchestrator::with_backends(config, runner.clone(), Arc::new(control.clone())).unwrap();
    Harness {
        orchestrator,
        runner,
        control,
    }
}

pub fn harness(base_dir: &Path) -> Harness {
    harness_with(test_config(base_dir))
}

/// Polls until the instance reports `status`, panicking after `timeout`.
pub async fn wait_for_status(
    orch: &Orchestrator,
    id: &InstanceId,
    status: InstanceStatus,
    timeout: Duration,
) -> Instance {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let inst = orch.get(id).await.unwrap();
        if inst.status == status {
            return inst;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{id} stuck in {} waiting for {status}",
            inst.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Serves `app` on an ephemeral loopback port.
pub async fn serve(app: Router) -> (String, u16) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://127.0.0.1:{port}"), port)
}

/// Requests a fake worker received outside its health and tab listing
/// endpoints, as `"METHOD /path?query body"`.
#[derive(Debug, Clone, Default)]
pub struct WorkerHits(Arc<Mutex<Vec<String>>>);

impl WorkerHits {
    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Minimal worker: healthy, lists `tabs`, records and echoes everything else.
pub fn fake_worker(name: &str, tabs: Vec<RemoteTab>, hits: WorkerHits) -> Router {
    let name = name.to_string();
    Router::new()
        .route(
            "/health",
            get(|| async { Json(serde_json::json!({"status": "ok"})) }),
        )
        .route(
            "/screencast/tabs",
            get(move || {
                let tabs = tabs.clone();
                async move { Json(tabs) }
            }),
        )
        .fallback(move |method: Method, uri: Uri, headers: HeaderMap, body: String| {
            let name = name.clone();
            let hits = hits.clone();
            async move {
                let line = format!("{method} {uri} {body}");
                hits.0.lock().unwrap().push(line.trim_end().to_string());
                Json(serde_json::json!({
                    "worker": name,
                    "path": uri.path(),
                    "query": uri.query(),
                    "client": headers.get("x-client").and_then(|v| v.to_str().ok()),
                    "body": body,
                }))
            }
        })
}

pub fn tab(id: &str, url: &str) -> RemoteTab {
    RemoteTab {
        id: id.to_string(),
        url: url.to_string(),
        title: None,
    }
}
