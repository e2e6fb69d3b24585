use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Context;
use chrono::Utc;
use futures_util::future::join_all;
use tabfleet_process::{
    Instance, InstanceId, InstanceStatus, InstanceTab, ProfileInstanceStatus, tab_id_from_target,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::{
    config::OrchestratorConfig,
    error::{Error, Result},
    health,
    platform::{OsProcessControl, ProcessControl, Signal},
    port_alloc::PortAllocator,
    ring_buffer::RingBuffer,
    runner::{Cmd, LocalRunner, ProcessRunner, inherited_env, merge_env_with_overrides},
    supervisor,
    validation::{validate_port, validate_profile_name},
};

pub(crate) struct InstanceEntry {
    pub(crate) instance: Instance,
    pub(crate) cmd: Option<Arc<dyn Cmd>>,
    pub(crate) logs: Arc<RingBuffer>,
    /// Distinguishes successive launches under the same id so a stale
    /// monitor never touches a newer record.
    pub(crate) generation: u64,
    /// Whether this record still owns its port in the allocator.
    holds_port: bool,
}

impl InstanceEntry {
    fn take_port(&mut self) -> Option<u16> {
        std::mem::take(&mut self.holds_port).then_some(self.instance.port)
    }
}

enum StopPlan {
    Done,
    Release(u16),
    Terminate {
        cmd: Arc<dyn Cmd>,
        url: String,
        generation: u64,
    },
}

/// Registry and lifecycle owner for every worker instance.
///
/// Cheap to clone; all clones share the same registry.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    instances: Arc<RwLock<HashMap<InstanceId, InstanceEntry>>>,
    runner: Arc<dyn ProcessRunner>,
    control: Arc<dyn ProcessControl>,
    ports: Arc<PortAllocator>,
    client: reqwest::Client,
    generation: Arc<AtomicU64>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> anyhow::Result<Self> {
        Self::with_backends(config, Arc::new(LocalRunner), Arc::new(OsProcessControl))
    }

    pub fn with_backends(
        config: OrchestratorConfig,
        runner: Arc<dyn ProcessRunner>,
        control: Arc<dyn ProcessControl>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.health_check_timeout)
            .build()
            .context("build health check client")?;
        let ports = PortAllocator::new(config.port_start, config.port_end);
        Ok(Self {
            config: Arc::new(config),
            instances: Arc::new(RwLock::new(HashMap::new())),
            runner,
            control,
            ports: Arc::new(ports),
            client,
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Live OS process when a handle with a pid exists, stored status
    /// otherwise. An exit already observed by the runner wins over the pid
    /// check, since the pid may have been reused.
    fn entry_active(&self, entry: &InstanceEntry) -> bool {
        match entry.cmd.as_ref() {
            Some(cmd) if cmd.exited() => false,
            Some(cmd) => match cmd.pid() {
                Some(pid) => self.control.is_alive(pid),
                None => entry.instance.status.is_active(),
            },
            None => entry.instance.status.is_active(),
        }
    }

    fn snapshot(&self, entry: &InstanceEntry) -> Instance {
        let mut inst = entry.instance.clone();
        if inst.status.is_active() && !self.entry_active(entry) {
            inst.status = InstanceStatus::Stopped;
        }
        inst
    }

    fn check_conflicts(
        &self,
        map: &HashMap<InstanceId, InstanceEntry>,
        name: &str,
        port: u16,
    ) -> Result<()> {
        for entry in map.values() {
            if !self.entry_active(entry) {
                continue;
            }
            if entry.instance.port == port {
                return Err(Error::conflict(format!(
                    "port {port} already in use by instance {:?}",
                    entry.instance.name
                )));
            }
            if entry.instance.name == name {
                return Err(Error::conflict(format!(
                    "profile {name:?} already has an active instance ({})",
                    entry.instance.id
                )));
            }
        }
        Ok(())
    }

    /// Starts a worker for profile `name`. Returns as soon as the process
    /// is spawned; readiness is tracked by the health monitor.
    pub async fn launch(&self, name: &str, port: Option<u16>, headless: bool) -> Result<Instance> {
        validate_profile_name(name)?;
        let (port, allocated) = match port {
            Some(port) => {
                validate_port(port)?;
                (port, false)
            }
            None => (self.ports.allocate()?, true),
        };

        let res = self.launch_on_port(name, port, headless).await;
        if res.is_err() && allocated {
            self.ports.release(port);
        }
        res
    }

    async fn launch_on_port(&self, name: &str, port: u16, headless: bool) -> Result<Instance> {
        {
            let map = self.instances.read().await;
            self.check_conflicts(&map, name, port)?;
        }
        if !self.runner.is_port_available(port) {
            return Err(Error::conflict(format!(
                "port {port} is already in use on this machine"
            )));
        }

        let id = InstanceId::for_profile(name, port);
        let profile_dir = self.config.base_dir.join(name);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let logs = Arc::new(RingBuffer::new(self.config.log_buffer_bytes));
        let instance = Instance {
            id: id.clone(),
            name: name.to_string(),
            profile: profile_dir.display().to_string(),
            port,
            url: format!("http://localhost:{port}"),
            headless,
            status: InstanceStatus::Starting,
            error: None,
            start_time: Utc::now(),
        };

        // Reserve the id and port before spawning so concurrent launches
        // see the conflict.
        let previous = {
            let mut map = self.instances.write().await;
            self.check_conflicts(&map, name, port)?;
            map.insert(
                id.clone(),
                InstanceEntry {
                    instance: instance.clone(),
                    cmd: None,
                    logs: logs.clone(),
                    generation,
                    holds_port: true,
                },
            )
        };
        self.ports.claim(port);

        let cmd = match self.start_worker(&profile_dir, port, headless, logs.clone()).await {
            Ok(cmd) => cmd,
            Err(e) => {
                error!(id = %id, port, error = %format!("{e:#}"), "instance failed to start");
                {
                    let mut map = self.instances.write().await;
                    if map.get(&id).is_some_and(|e| e.generation == generation) {
                        match previous {
                            Some(mut prev) => {
                                prev.holds_port = false;
                                map.insert(id.clone(), prev);
                            }
                            None => {
                                map.remove(&id);
                            }
                        }
                    }
                }
                self.ports.release(port);
                return Err(e.into());
            }
        };

        let superseded = {
            let mut map = self.instances.write().await;
            match map.get_mut(&id) {
                Some(entry) if entry.generation == generation => {
                    entry.cmd = Some(cmd.clone());
                    entry.instance.status != InstanceStatus::Starting
                }
                _ => true,
            }
        };
        if superseded {
            warn!(id = %id, "instance was stopped while starting; killing worker");
            self.kill_cmd(cmd.as_ref());
            return Err(Error::conflict(format!(
                "instance {id} was stopped while starting"
            )));
        }

        info!(id = %id, port, pid = ?cmd.pid(), headless, "instance launched");
        health::spawn_monitor(self.clone(), id, port, generation, cmd, logs);
        Ok(instance)
    }

    async fn start_worker(
        &self,
        profile_dir: &Path,
        port: u16,
        headless: bool,
        logs: Arc<RingBuffer>,
    ) -> anyhow::Result<Arc<dyn Cmd>> {
        let user_data = profile_dir.join("Default");
        let state_dir = profile_dir.join(".tabfleet-state");
        tokio::fs::create_dir_all(&user_data)
            .await
            .with_context(|| format!("create profile dir {}", user_data.display()))?;
        tokio::fs::create_dir_all(&state_dir)
            .await
            .with_context(|| format!("create state dir {}", state_dir.display()))?;

        let env = worker_env(inherited_env(), profile_dir, &state_dir, port, headless);
        self.runner.run(&self.config.binary, &env, logs)
    }

    /// Relaunches a stopped record with its original name, port and mode.
    pub async fn restart(&self, id: &InstanceId) -> Result<Instance> {
        let (name, port, headless) = {
            let map = self.instances.read().await;
            let entry = map
                .get(id)
                .ok_or_else(|| Error::not_found(format!("instance {id} not found")))?;
            if self.entry_active(entry) {
                return Err(Error::conflict(format!("instance {id} is already active")));
            }
            (
                entry.instance.name.clone(),
                entry.instance.port,
                entry.instance.headless,
            )
        };
        self.launch(&name, Some(port), headless).await
    }

    pub async fn stop(&self, id: &InstanceId) -> Result<()> {
        let plan = {
            let mut map = self.instances.write().await;
            let active = match map.get(id) {
                Some(entry) => self.entry_active(entry),
                None => return Err(Error::not_found(format!("instance {id} not found"))),
            };
            let Some(entry) = map.get_mut(id) else {
                return Err(Error::not_found(format!("instance {id} not found")));
            };

            if !active || entry.cmd.is_none() {
                if entry.instance.status == InstanceStatus::Stopped {
                    StopPlan::Done
                } else {
                    entry.instance.status = InstanceStatus::Stopped;
                    entry.instance.error = None;
                    match entry.take_port() {
                        Some(port) => StopPlan::Release(port),
                        None => StopPlan::Done,
                    }
                }
            } else {
                entry.instance.status = InstanceStatus::Stopping;
                match entry.cmd.clone() {
                    Some(cmd) => StopPlan::Terminate {
                        cmd,
                        url: entry.instance.url.clone(),
                        generation: entry.generation,
                    },
                    None => StopPlan::Done,
                }
            }
        };

        let (cmd, url, generation) = match plan {
            StopPlan::Done => return Ok(()),
            StopPlan::Release(port) => {
                self.ports.release(port);
                info!(id = %id, "instance marked stopped");
                return Ok(());
            }
            StopPlan::Terminate {
                cmd,
                url,
                generation,
            } => (cmd, url, generation),
        };

        info!(id = %id, pid = ?cmd.pid(), "stopping instance");
        match supervisor::terminate(
            &self.client,
            self.control.as_ref(),
            cmd.as_ref(),
            &url,
            &self.config.stop,
        )
        .await
        {
            Ok(step) => {
                info!(id = %id, step = step.as_str(), "instance stopped");
                self.mark_stopped(id, generation).await;
                Ok(())
            }
            Err(still_running) => {
                let msg = still_running.to_string();
                error!(id = %id, error = %msg, "instance did not stop");
                {
                    let mut map = self.instances.write().await;
                    if let Some(entry) = map.get_mut(id)
                        && entry.generation == generation
                    {
                        entry.instance.status = InstanceStatus::Error;
                        entry.instance.error = Some(msg);
                    }
                }
                Err(anyhow::Error::new(still_running).into())
            }
        }
    }

    /// Stops every active instance of a profile, one after another.
    pub async fn stop_profile(&self, name: &str) -> Result<()> {
        let ids = {
            let map = self.instances.read().await;
            let mut ids: Vec<InstanceId> = map
                .values()
                .filter(|e| e.instance.name == name && self.entry_active(e))
                .map(|e| e.instance.id.clone())
                .collect();
            ids.sort();
            ids
        };
        if ids.is_empty() {
            return Err(Error::not_found(format!(
                "no active instance for profile {name:?}"
            )));
        }

        let mut failures = Vec::new();
        for id in &ids {
            if let Err(e) = self.stop(id).await {
                failures.push(format!("{id}: {e}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(failures.join("; ")).into())
        }
    }

    pub async fn list(&self) -> Vec<Instance> {
        let map = self.instances.read().await;
        let mut out: Vec<Instance> = map.values().map(|e| self.snapshot(e)).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn get(&self, id: &InstanceId) -> Result<Instance> {
        let map = self.instances.read().await;
        map.get(id)
            .map(|e| self.snapshot(e))
            .ok_or_else(|| Error::not_found(format!("instance {id} not found")))
    }

    pub async fn logs(&self, id: &InstanceId) -> Result<String> {
        let logs = {
            let map = self.instances.read().await;
            map.get(id)
                .map(|e| e.logs.clone())
                .ok_or_else(|| Error::not_found(format!("instance {id} not found")))?
        };
        Ok(logs.contents())
    }

    /// Status of a profile's most relevant instance: the active one if any,
    /// else the most recently started.
    pub async fn profile_status(&self, name: &str) -> ProfileInstanceStatus {
        let map = self.instances.read().await;
        let mut best: Option<(bool, Instance)> = None;
        for entry in map.values().filter(|e| e.instance.name == name) {
            let active = self.entry_active(entry);
            let inst = self.snapshot(entry);
            let better = match &best {
                None => true,
                Some((best_active, best_inst)) => {
                    (active && !best_active)
                        || (active == *best_active && inst.start_time > best_inst.start_time)
                }
            };
            if better {
                best = Some((active, inst));
            }
        }

        match best {
            Some((_, inst)) => ProfileInstanceStatus {
                name: name.to_string(),
                running: inst.status == InstanceStatus::Running,
                status: inst.status,
                port: Some(inst.port),
                id: Some(inst.id),
            },
            None => ProfileInstanceStatus {
                name: name.to_string(),
                running: false,
                status: InstanceStatus::Stopped,
                port: None,
                id: None,
            },
        }
    }

    async fn active_ids(&self) -> Vec<InstanceId> {
        let map = self.instances.read().await;
        map.values()
            .filter(|e| self.entry_active(e))
            .map(|e| e.instance.id.clone())
            .collect()
    }

    /// Cooperative stop of every active instance, all at once.
    pub async fn shutdown(&self) {
        let ids = self.active_ids().await;
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "stopping all instances");
        let results = join_all(ids.iter().map(|id| self.stop(id))).await;
        for (id, res) in ids.iter().zip(results) {
            if let Err(e) = res {
                warn!(id = %id, error = %e, "shutdown: stop failed");
            }
        }
    }

    /// Kills every active instance without asking it first.
    pub async fn force_shutdown(&self) {
        let mut victims = Vec::new();
        let mut ports = Vec::new();
        {
            let mut map = self.instances.write().await;
            let active: Vec<InstanceId> = map
                .values()
                .filter(|e| self.entry_active(e))
                .map(|e| e.instance.id.clone())
                .collect();
            for id in active {
                let Some(entry) = map.get_mut(&id) else {
                    continue;
                };
                entry.instance.status = InstanceStatus::Stopped;
                entry.instance.error = None;
                if let Some(cmd) = entry.cmd.clone() {
                    victims.push((id, cmd));
                }
                ports.extend(entry.take_port());
            }
        }

        for (id, cmd) in &victims {
            warn!(id = %id, pid = ?cmd.pid(), "force shutdown: killing instance");
            self.kill_cmd(cmd.as_ref());
        }
        for port in ports {
            self.ports.release(port);
        }
    }

    fn kill_cmd(&self, cmd: &dyn Cmd) {
        cmd.cancel();
        if let Some(pid) = cmd.pid()
            && let Err(e) = self.control.signal_group(pid, Signal::Kill)
        {
            warn!(pid, error = %e, "kill process group failed");
        }
    }

    /// Running, OS-alive instances in id order.
    pub async fn running_instances(&self) -> Vec<Instance> {
        let map = self.instances.read().await;
        let mut out: Vec<Instance> = map
            .values()
            .filter(|e| e.instance.status == InstanceStatus::Running && self.entry_active(e))
            .map(|e| e.instance.clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn first_running_url(&self) -> Option<String> {
        self.running_instances().await.into_iter().next().map(|i| i.url)
    }

    /// Tabs of every running instance. Workers that fail to answer are
    /// left out.
    pub async fn all_tabs(&self) -> Vec<InstanceTab> {
        let mut out = Vec::new();
        for inst in self.running_instances().await {
            match health::fetch_tabs(&self.client, &inst.url).await {
                Ok(tabs) => out.extend(tabs.into_iter().map(|t| InstanceTab {
                    instance_id: inst.id.clone(),
                    tab_id: t.id,
                    url: t.url,
                })),
                Err(e) => debug!(id = %inst.id, error = %format!("{e:#}"), "tab listing failed"),
            }
        }
        out
    }

    /// Finds the running instance whose worker reports `tab_id`, matching
    /// either the raw target id or its normalized form.
    pub async fn find_instance_by_tab(&self, tab_id: &str) -> Result<Instance> {
        for inst in self.running_instances().await {
            let tabs = match health::fetch_tabs(&self.client, &inst.url).await {
                Ok(tabs) => tabs,
                Err(e) => {
                    debug!(id = %inst.id, error = %format!("{e:#}"), "tab listing failed");
                    continue;
                }
            };
            if tabs
                .iter()
                .any(|t| t.id == tab_id || tab_id_from_target(&t.id) == tab_id)
            {
                return Ok(inst);
            }
        }
        Err(Error::not_found(format!("tab {tab_id} not found")))
    }

    pub async fn screencast_url(&self, id: &InstanceId, tab_id: &str) -> Result<String> {
        let inst = self.get(id).await?;
        if inst.status != InstanceStatus::Running {
            return Err(Error::not_found(format!("instance {id} is not running")));
        }
        let mut url = reqwest::Url::parse(&format!("ws://localhost:{}/screencast", inst.port))
            .map_err(|e| Error::from(anyhow::Error::new(e)))?;
        url.query_pairs_mut().append_pair("tabId", tab_id);
        Ok(url.into())
    }

    pub(crate) async fn mark_ready(&self, id: &InstanceId, generation: u64, url: &str) -> bool {
        let mut map = self.instances.write().await;
        match map.get_mut(id) {
            Some(entry)
                if entry.generation == generation
                    && entry.instance.status == InstanceStatus::Starting =>
            {
                entry.instance.status = InstanceStatus::Running;
                entry.instance.url = url.to_string();
                true
            }
            _ => false,
        }
    }

    pub(crate) async fn mark_failed(&self, id: &InstanceId, generation: u64, msg: String) -> bool {
        let mut map = self.instances.write().await;
        match map.get_mut(id) {
            Some(entry)
                if entry.generation == generation
                    && matches!(
                        entry.instance.status,
                        InstanceStatus::Starting | InstanceStatus::Running
                    ) =>
            {
                entry.instance.status = InstanceStatus::Error;
                entry.instance.error = Some(msg);
                true
            }
            _ => false,
        }
    }

    /// Bookkeeping once the worker process is gone. A record in `stopping`
    /// is left to `stop`.
    pub(crate) async fn mark_exited(&self, id: &InstanceId, generation: u64) {
        let port = {
            let mut map = self.instances.write().await;
            let Some(entry) = map.get_mut(id) else {
                return;
            };
            if entry.generation != generation {
                return;
            }
            match entry.instance.status {
                InstanceStatus::Starting | InstanceStatus::Running => {
                    entry.instance.status = InstanceStatus::Stopped;
                    entry.take_port()
                }
                InstanceStatus::Error => entry.take_port(),
                InstanceStatus::Stopping | InstanceStatus::Stopped => None,
            }
        };
        if let Some(port) = port {
            self.ports.release(port);
        }
    }

    async fn mark_stopped(&self, id: &InstanceId, generation: u64) {
        let port = {
            let mut map = self.instances.write().await;
            match map.get_mut(id) {
                Some(entry) if entry.generation == generation => {
                    entry.instance.status = InstanceStatus::Stopped;
                    entry.instance.error = None;
                    entry.take_port()
                }
                _ => None,
            }
        };
        if let Some(port) = port {
            self.ports.release(port);
        }
    }
}

/// Worker environment: the orchestrator's own variables overlaid with the
/// worker contract keys.
pub(crate) fn worker_env(
    base: Vec<(String, String)>,
    profile_dir: &Path,
    state_dir: &Path,
    port: u16,
    headless: bool,
) -> Vec<(String, String)> {
    let overrides = BTreeMap::from([
        ("BRIDGE_PORT".to_string(), port.to_string()),
        (
            "BRIDGE_PROFILE".to_string(),
            profile_dir.display().to_string(),
        ),
        (
            "BRIDGE_STATE_DIR".to_string(),
            state_dir.display().to_string(),
        ),
        ("BRIDGE_HEADLESS".to_string(), headless.to_string()),
        ("BRIDGE_NO_RESTORE".to_string(), "true".to_string()),
    ]);
    merge_env_with_overrides(base, &overrides)
}
