use std::sync::Arc;

use anyhow::Context;
use tabfleet_process::{InstanceId, RemoteTab};
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    registry::Orchestrator,
    ring_buffer::{RingBuffer, tail_line},
    runner::{Cmd, ProcessExit},
};

fn candidate_urls(port: u16) -> [String; 3] {
    [
        format!("http://127.0.0.1:{port}"),
        format!("http://[::1]:{port}"),
        format!("http://localhost:{port}"),
    ]
}

/// Checks `/health` on each loopback form of `port`. Any status below 500
/// counts as healthy. Returns the base URL that answered, or a description
/// of the last attempt.
pub async fn check_health(client: &reqwest::Client, port: u16) -> Result<String, String> {
    let mut last = String::from("no health check attempted");
    for base in candidate_urls(port) {
        let url = format!("{base}/health");
        match client.get(&url).send().await {
            Ok(resp) => {
                let code = resp.status().as_u16();
                last = format!("{url} -> HTTP {code}");
                if code < 500 {
                    return Ok(base);
                }
            }
            Err(e) => last = format!("{url} -> {e}"),
        }
    }
    Err(last)
}

pub async fn fetch_tabs(client: &reqwest::Client, base_url: &str) -> anyhow::Result<Vec<RemoteTab>> {
    let url = format!("{}/screencast/tabs", base_url.trim_end_matches('/'));
    let resp = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?
        .error_for_status()
        .with_context(|| format!("GET {url}"))?;
    resp.json::<Vec<RemoteTab>>()
        .await
        .with_context(|| format!("decode {url}"))
}

fn with_log_tail(msg: String, logs: &RingBuffer) -> String {
    let tail = tail_line(&logs.contents());
    if tail.is_empty() {
        msg
    } else {
        format!("{msg} | {tail}")
    }
}

pub(crate) fn spawn_monitor(
    orch: Orchestrator,
    id: InstanceId,
    port: u16,
    generation: u64,
    cmd: Arc<dyn Cmd>,
    logs: Arc<RingBuffer>,
) {
    tokio::spawn(monitor(orch, id, port, generation, cmd, logs));
}

async fn monitor(
    orch: Orchestrator,
    id: InstanceId,
    port: u16,
    generation: u64,
    cmd: Arc<dyn Cmd>,
    logs: Arc<RingBuffer>,
) {
    let (exit_tx, mut exit_rx) = oneshot::channel::<ProcessExit>();
    tokio::spawn(async move {
        let _ = exit_tx.send(cmd.wait().await);
    });

    let cfg = orch.config().clone();
    let deadline = Instant::now() + cfg.startup_timeout;
    let mut last_check = String::from("no health check attempted");
    let mut exit: Option<ProcessExit> = None;

    loop {
        let now = Instant::now();
        if now >= deadline {
            let msg = with_log_tail(
                format!(
                    "health check timeout after {:?} ({last_check})",
                    cfg.startup_timeout
                ),
                &logs,
            );
            warn!(id = %id, error = %msg, "instance failed health check");
            orch.mark_failed(&id, generation, msg).await;
            break;
        }

        tokio::select! {
            res = &mut exit_rx => {
                let e = res.unwrap_or_else(|_| ProcessExit::WaitFailed("exit waiter dropped".to_string()));
                let msg = with_log_tail(format!("process exited before health check: {e}"), &logs);
                warn!(id = %id, error = %msg, "instance exited during startup");
                orch.mark_failed(&id, generation, msg).await;
                exit = Some(e);
                break;
            }
            _ = tokio::time::sleep(cfg.health_poll_interval.min(deadline - now)) => {}
        }

        match check_health(orch.client(), port).await {
            Ok(url) => {
                if orch.mark_ready(&id, generation, &url).await {
                    info!(id = %id, %url, "instance ready");
                }
                break;
            }
            Err(desc) => {
                debug!(id = %id, check = %desc, "instance not ready");
                last_check = desc;
            }
        }
    }

    let exit = match exit {
        Some(e) => e,
        None => exit_rx
            .await
            .unwrap_or_else(|_| ProcessExit::WaitFailed("exit waiter dropped".to_string())),
    };
    info!(id = %id, %exit, "instance process exited");
    orch.mark_exited(&id, generation).await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::{Json, Router, http::StatusCode, routing::get};

    use super::*;
    use crate::testing::serve;

    #[tokio::test]
    async fn client_errors_still_count_as_healthy() {
        let app = Router::new().route("/health", get(|| async { StatusCode::UNAUTHORIZED }));
        let (base, port) = serve(app).await;
        let url = check_health(&reqwest::Client::new(), port).await.unwrap();
        assert_eq!(url, base);
    }

    #[tokio::test]
    async fn server_errors_are_unhealthy() {
        let app = Router::new().route(
            "/health",
            get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        );
        let (_, port) = serve(app).await;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(500))
            .build()
            .unwrap();
        let desc = check_health(&client, port).await.unwrap_err();
        assert!(desc.contains("/health -> "), "{desc}");
    }

    #[tokio::test]
    async fn fetch_tabs_decodes_listing() {
        let app = Router::new().route(
            "/screencast/tabs",
            get(|| async {
                Json(serde_json::json!([
                    {"id": "t1", "url": "https://a.test"},
                    {"id": "t2"}
                ]))
            }),
        );
        let (base, _) = serve(app).await;
        let tabs = fetch_tabs(&reqwest::Client::new(), &base).await.unwrap();
        assert_eq!(tabs.len(), 2);
        assert_eq!(tabs[0].id, "t1");
        assert_eq!(tabs[1].url, "");
    }

    #[tokio::test]
    async fn fetch_tabs_rejects_error_status() {
        let app = Router::new().route(
            "/screencast/tabs",
            get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let (base, _) = serve(app).await;
        assert!(fetch_tabs(&reqwest::Client::new(), &base).await.is_err());
    }

    #[test]
    fn log_tail_is_appended_when_present() {
        let logs = RingBuffer::new(256);
        assert_eq!(with_log_tail("boom".to_string(), &logs), "boom");
        logs.write(b"starting\nchrome not found\n");
        assert_eq!(
            with_log_tail("boom".to_string(), &logs),
            "boom | chrome not found"
        );
    }
}
