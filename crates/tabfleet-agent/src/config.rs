use std::{path::PathBuf, time::Duration};

use tracing::error;

pub const DEFAULT_PORT_START: u16 = 9868;
pub const DEFAULT_PORT_END: u16 = 9968;
const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 45_000;
const DEFAULT_HEALTH_POLL_MS: u64 = 500;
const DEFAULT_LOG_BUFFER_BYTES: usize = 64 * 1024;

pub fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

pub fn env_u16(name: &str) -> Option<u16> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u16>().ok())
}

pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn env_bool(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| parse_bool(&v))
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Wait windows for each step of the stop escalation.
#[derive(Debug, Clone, Copy)]
pub struct StopTimings {
    pub shutdown_request: Duration,
    pub graceful_wait: Duration,
    pub term_wait: Duration,
    pub kill_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for StopTimings {
    fn default() -> Self {
        Self {
            shutdown_request: Duration::from_secs(4),
            graceful_wait: Duration::from_secs(5),
            term_wait: Duration::from_secs(3),
            kill_wait: Duration::from_secs(2),
            poll_interval: Duration::from_millis(150),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Root under which each profile gets its own directory.
    pub base_dir: PathBuf,
    /// Worker executable launched for every instance.
    pub binary: PathBuf,
    pub port_start: u16,
    pub port_end: u16,
    pub startup_timeout: Duration,
    pub health_poll_interval: Duration,
    pub health_check_timeout: Duration,
    pub log_buffer_bytes: usize,
    pub stop: StopTimings,
}

impl OrchestratorConfig {
    pub fn new(base_dir: impl Into<PathBuf>, binary: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            binary: binary.into(),
            port_start: DEFAULT_PORT_START,
            port_end: DEFAULT_PORT_END,
            startup_timeout: Duration::from_millis(DEFAULT_STARTUP_TIMEOUT_MS),
            health_poll_interval: Duration::from_millis(DEFAULT_HEALTH_POLL_MS),
            health_check_timeout: Duration::from_secs(3),
            log_buffer_bytes: DEFAULT_LOG_BUFFER_BYTES,
            stop: StopTimings::default(),
        }
    }

    pub fn from_env() -> Self {
        let base_dir = env_string("TABFLEET_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_base_dir);
        let binary = env_string("TABFLEET_WORKER_BIN").unwrap_or_else(|| "tabfleet-worker".to_string());

        let mut cfg = Self::new(base_dir, binary);

        let start = env_u16("TABFLEET_PORT_START").unwrap_or(DEFAULT_PORT_START);
        let end = env_u16("TABFLEET_PORT_END").unwrap_or(DEFAULT_PORT_END);
        (cfg.port_start, cfg.port_end) = checked_port_range(start, end);

        cfg.startup_timeout = Duration::from_millis(
            env_u64("TABFLEET_STARTUP_TIMEOUT_MS")
                .map(|v| v.clamp(1000, 10 * 60 * 1000))
                .unwrap_or(DEFAULT_STARTUP_TIMEOUT_MS),
        );
        cfg.health_poll_interval = Duration::from_millis(
            env_u64("TABFLEET_HEALTH_POLL_MS")
                .map(|v| v.clamp(50, 10_000))
                .unwrap_or(DEFAULT_HEALTH_POLL_MS),
        );
        cfg.log_buffer_bytes = env_usize("TABFLEET_LOG_BUFFER_BYTES")
            .map(|v| v.clamp(4 * 1024, 16 * 1024 * 1024))
            .unwrap_or(DEFAULT_LOG_BUFFER_BYTES);
        cfg
    }
}

fn default_base_dir() -> PathBuf {
    match env_string("HOME") {
        Some(home) => PathBuf::from(home).join(".tabfleet").join("profiles"),
        None => PathBuf::from(".tabfleet").join("profiles"),
    }
}

/// Falls back to the default range when the configured one is unusable.
pub fn checked_port_range(start: u16, end: u16) -> (u16, u16) {
    if start < 1024 || start > end {
        error!(start, end, "invalid port range, using default");
        return (DEFAULT_PORT_START, DEFAULT_PORT_END);
    }
    (start, end)
}
