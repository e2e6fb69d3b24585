use std::{net::SocketAddr, time::Duration};

use tabfleet_agent::{
    OrchestratorConfig,
    config::{env_bool, env_string, env_u64},
    validation::parse_port,
};
use tracing::{error, warn};

const DEFAULT_LISTEN: &str = "127.0.0.1:9867";
const DEFAULT_PROXY_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub listen: SocketAddr,
    pub proxy_timeout: Duration,
    pub auto_launch: bool,
    pub default_profile: String,
    pub default_port: Option<u16>,
    pub headed: bool,
    pub orchestrator: OrchestratorConfig,
}

impl ControlConfig {
    pub fn from_env() -> Self {
        let listen = env_string("TABFLEET_LISTEN").unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let listen = parse_listen(&listen);

        let default_port = match env_string("TABFLEET_DEFAULT_PORT") {
            Some(raw) => parse_port(&raw).unwrap_or_else(|e| {
                warn!(value = %raw, error = %e, "ignoring TABFLEET_DEFAULT_PORT");
                None
            }),
            None => None,
        };

        Self {
            listen,
            proxy_timeout: Duration::from_millis(
                env_u64("TABFLEET_PROXY_TIMEOUT_MS")
                    .map(|v| v.clamp(1000, 10 * 60 * 1000))
                    .unwrap_or(DEFAULT_PROXY_TIMEOUT_MS),
            ),
            auto_launch: env_bool("TABFLEET_AUTO_LAUNCH"),
            default_profile: env_string("TABFLEET_DEFAULT_PROFILE")
                .unwrap_or_else(|| "default".to_string()),
            default_port,
            headed: env_bool("TABFLEET_HEADED"),
            orchestrator: OrchestratorConfig::from_env(),
        }
    }
}

fn parse_listen(raw: &str) -> SocketAddr {
    match raw.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(value = %raw, error = %e, "invalid TABFLEET_LISTEN, using default");
            SocketAddr::from(([127, 0, 0, 1], 9867))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_address_falls_back() {
        assert_eq!(parse_listen("0.0.0.0:8080").port(), 8080);
        assert_eq!(parse_listen("nope"), SocketAddr::from(([127, 0, 0, 1], 9867)));
        assert_eq!(parse_listen(DEFAULT_LISTEN).port(), 9867);
    }
}
