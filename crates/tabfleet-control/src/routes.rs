use axum::{
    Json, Router,
    extract::State,
    middleware,
    routing::{get, post},
};
use serde_json::{Value, json};
use tracing::info;

use crate::{instances, profiles, security, state::AppState, tabs};

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "mode": "orchestrator"}))
}

async fn shutdown(State(state): State<AppState>) -> Json<Value> {
    info!("shutdown requested over HTTP");
    state.shutdown.notify_one();
    Json(json!({"status": "shutting down"}))
}

/// Tab-scoped worker endpoints, forwarded to whichever instance owns the tab.
const TAB_GET: [&str; 4] = ["snapshot", "screenshot", "text", "download"];
const TAB_POST: [&str; 7] = [
    "navigate", "action", "actions", "evaluate", "upload", "lock", "unlock",
];
const TAB_ANY: [&str; 2] = ["pdf", "cookies"];

/// Worker endpoints reachable without naming an instance or tab.
const SHORTHAND_GET: [&str; 6] = [
    "/snapshot",
    "/screenshot",
    "/text",
    "/download",
    "/screencast",
    "/screencast/tabs",
];
const SHORTHAND_POST: [&str; 6] = [
    "/navigate",
    "/action",
    "/actions",
    "/evaluate",
    "/tab",
    "/upload",
];

pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/shutdown", post(shutdown))
        .route("/instances", get(instances::list))
        .route("/instances/tabs", get(instances::all_tabs))
        .route("/instances/launch", post(instances::launch))
        .route("/instances/start", post(instances::start))
        .route("/instances/:id", get(instances::get))
        .route("/instances/:id/start", post(instances::restart))
        .route("/instances/:id/stop", post(instances::stop))
        .route("/instances/:id/logs", get(instances::logs))
        .route("/instances/:id/tabs", get(instances::proxy))
        .route("/instances/:id/tab", post(instances::proxy))
        .route("/instances/:id/screencast", get(instances::proxy))
        .route("/instances/:id/proxy/screencast", get(instances::screencast_url))
        .route("/instances/:id/tabs/open", post(instances::open_tab))
        .route("/profiles/:id/start", post(profiles::start))
        .route("/profiles/:id/stop", post(profiles::stop))
        .route("/profiles/:id/instance", get(profiles::instance))
        .route("/tabs/:id/close", post(tabs::close))
        .route("/tabs", get(tabs::shorthand_tabs))
        .route("/cookies", get(tabs::shorthand).post(tabs::shorthand));

    for name in TAB_GET {
        app = app.route(&format!("/tabs/:id/{name}"), get(tabs::proxy));
    }
    for name in TAB_POST {
        app = app.route(&format!("/tabs/:id/{name}"), post(tabs::proxy));
    }
    for name in TAB_ANY {
        app = app.route(
            &format!("/tabs/:id/{name}"),
            get(tabs::proxy).post(tabs::proxy),
        );
    }
    for path in SHORTHAND_GET {
        app = app.route(path, get(tabs::shorthand));
    }
    for path in SHORTHAND_POST {
        app = app.route(path, post(tabs::shorthand));
    }

    app.layer(middleware::from_fn(security::request_id))
        .with_state(state)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use tabfleet_agent::{
        ProfileResolver,
        testing::{Harness, WorkerHits, fake_worker, harness, serve, tab, wait_for_status},
    };
    use tabfleet_process::{InstanceId, InstanceStatus};

    use super::*;
    use crate::security::REQUEST_ID_HEADER;

    struct Control {
        base: String,
        h: Harness,
        state: AppState,
        _dir: tempfile::TempDir,
    }

    async fn control() -> Control {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path());
        let state = AppState::new(
            h.orchestrator.clone(),
            ProfileResolver::new(dir.path()),
            Duration::from_secs(5),
        )
        .unwrap();
        let (base, _) = serve(router(state.clone())).await;
        Control {
            base,
            h,
            state,
            _dir: dir,
        }
    }

    async fn running_worker(c: &Control, name: &str, tabs: &[&str]) -> (InstanceId, WorkerHits) {
        let hits = WorkerHits::default();
        let tabs = tabs.iter().map(|t| tab(t, "https://example.test")).collect();
        let (_, port) = serve(fake_worker(name, tabs, hits.clone())).await;
        let inst = c.h.orchestrator.launch(name, Some(port), true).await.unwrap();
        wait_for_status(&c.h.orchestrator, &inst.id, InstanceStatus::Running, Duration::from_secs(5))
            .await;
        (inst.id, hits)
    }

    #[tokio::test]
    async fn health_and_request_id() {
        let c = control().await;
        let resp = reqwest::get(format!("{}/health", c.base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert!(resp.headers().contains_key(REQUEST_ID_HEADER));
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({"status": "ok", "mode": "orchestrator"}));

        let resp = reqwest::Client::new()
            .get(format!("{}/health", c.base))
            .header(REQUEST_ID_HEADER, "req-42")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.headers()[REQUEST_ID_HEADER], "req-42");
    }

    #[tokio::test]
    async fn launch_statuses() {
        let c = control().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/instances/launch", c.base))
            .json(&json!({"name": "alpha", "port": "9931"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let inst: Value = resp.json().await.unwrap();
        assert_eq!(inst["name"], "alpha");
        assert_eq!(inst["port"], 9931);
        assert_eq!(inst["headless"], true);

        let resp = client
            .post(format!("{}/instances/launch", c.base))
            .json(&json!({"name": "alpha", "port": 9932}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "conflict");

        let resp = client
            .post(format!("{}/instances/launch", c.base))
            .json(&json!({"name": "../evil"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .post(format!("{}/instances/launch", c.base))
            .json(&json!({"profileId": "prof_missing"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client
            .post(format!("{}/instances/start", c.base))
            .json(&json!({"mode": "headed"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let inst: Value = resp.json().await.unwrap();
        assert!(inst["name"].as_str().unwrap().starts_with("instance-"));
        assert_eq!(inst["headless"], false);
    }

    #[tokio::test]
    async fn unknown_instance_is_json_404() {
        let c = control().await;
        let resp = reqwest::get(format!("{}/instances/nope-1", c.base)).await.unwrap();
        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "not_found");
        assert!(body["error"].as_str().unwrap().contains("nope-1"));
    }

    #[tokio::test]
    async fn stop_then_logs() {
        let c = control().await;
        let (id, _) = running_worker(&c, "alpha", &[]).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/instances/{id}/stop", c.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({"status": "stopped", "id": id.as_str()}));

        let resp = client
            .post(format!("{}/instances/{id}/stop", c.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let resp = reqwest::get(format!("{}/instances/{id}/logs", c.base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert!(
            resp.headers()["content-type"]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
        assert!(resp.text().await.unwrap().contains("fake worker booting"));

        let resp = client
            .post(format!("{}/profiles/alpha/stop", c.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn tab_routes_reach_only_the_owner() {
        let c = control().await;
        let (_, hits_a) = running_worker(&c, "alpha", &["A1"]).await;
        let (_, hits_b) = running_worker(&c, "beta", &["t1"]).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/tabs/t1/navigate?wait=1", c.base))
            .body(r#"{"url":"https://x"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["worker"], "beta");
        assert_eq!(body["path"], "/tabs/t1/navigate");
        assert_eq!(body["query"], "wait=1");
        assert!(hits_a.all().is_empty());
        assert_eq!(
            hits_b.all(),
            vec![r#"POST /tabs/t1/navigate?wait=1 {"url":"https://x"}"#.to_string()]
        );

        let resp = client
            .post(format!("{}/tabs/t1/close", c.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["path"], "/tab");
        let sent: Value = serde_json::from_str(body["body"].as_str().unwrap()).unwrap();
        assert_eq!(sent, json!({"action": "close", "tabId": "t1"}));

        let resp = reqwest::get(format!("{}/tabs/zzz/snapshot", c.base)).await.unwrap();
        assert_eq!(resp.status(), 404);

        let resp = reqwest::get(format!("{}/instances/tabs", c.base)).await.unwrap();
        let tabs: Value = resp.json().await.unwrap();
        assert_eq!(tabs.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn instance_scoped_routes() {
        let c = control().await;
        let (id, hits) = running_worker(&c, "alpha", &["T"]).await;
        let client = reqwest::Client::new();

        let resp = reqwest::get(format!("{}/instances/{id}/tabs", c.base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["path"], "/tabs");

        let resp = client
            .post(format!("{}/instances/{id}/tabs/open?source=ui", c.base))
            .header("x-client", "dashboard")
            .json(&json!({"url": "https://new"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["client"], "dashboard");
        let last = hits.all().pop().unwrap();
        assert!(last.starts_with("POST /tab?source=ui "), "{last}");
        assert!(last.contains(r#""action":"new""#), "{last}");

        let resp = reqwest::get(format!("{}/instances/{id}/proxy/screencast?tabId=T", c.base))
            .await
            .unwrap();
        let body: Value = resp.json().await.unwrap();
        assert!(body["wsUrl"].as_str().unwrap().ends_with("/screencast?tabId=T"));

        let resp = reqwest::get(format!(
            "{}/instances/{id}/proxy/screencast?tabId=a%26b",
            c.base
        ))
        .await
        .unwrap();
        let body: Value = resp.json().await.unwrap();
        assert!(body["wsUrl"].as_str().unwrap().ends_with("/screencast?tabId=a%26b"));

        let resp = reqwest::get(format!("{}/instances/{id}/proxy/screencast", c.base))
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        c.h.orchestrator.stop(&id).await.unwrap();
        let resp = reqwest::get(format!("{}/instances/{id}/tabs", c.base)).await.unwrap();
        assert_eq!(resp.status(), 503);
    }

    #[tokio::test]
    async fn instance_proxy_strips_encoded_id() {
        let c = control().await;
        let (id, hits) = running_worker(&c, "my work", &[]).await;
        assert!(id.as_str().starts_with("my work-"));
        let encoded = id.as_str().replace(' ', "%20");

        let resp = reqwest::get(format!("{}/instances/{encoded}/tabs?all=1", c.base))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["path"], "/tabs");
        assert_eq!(body["query"], "all=1");
        assert_eq!(hits.all(), vec!["GET /tabs?all=1".to_string()]);
    }

    #[tokio::test]
    async fn shorthand_without_instances() {
        let c = control().await;
        let resp = reqwest::get(format!("{}/tabs", c.base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({"tabs": []}));

        let resp = reqwest::get(format!("{}/snapshot", c.base)).await.unwrap();
        assert_eq!(resp.status(), 503);
    }

    #[tokio::test]
    async fn shorthand_forwards_to_first_running() {
        let c = control().await;
        let (_, hits) = running_worker(&c, "alpha", &[]).await;
        let resp = reqwest::get(format!("{}/text?mode=raw", c.base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(hits.all(), vec!["GET /text?mode=raw".to_string()]);
    }

    #[tokio::test]
    async fn profile_routes() {
        let c = control().await;
        c.state.profiles.ensure("work").await.unwrap();
        let client = reqwest::Client::new();

        let resp = reqwest::get(format!("{}/profiles/work/instance", c.base)).await.unwrap();
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["running"], false);
        assert_eq!(body["status"], "stopped");

        let resp = client
            .post(format!("{}/profiles/work/start", c.base))
            .json(&json!({"port": 9941, "headless": true}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let inst: Value = resp.json().await.unwrap();
        assert_eq!(inst["port"], 9941);

        let resp = reqwest::get(format!("{}/profiles/work/instance", c.base)).await.unwrap();
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["name"], "work");
        assert_eq!(body["port"], 9941);

        let resp = client
            .post(format!("{}/profiles/work/stop", c.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let resp = client
            .post(format!("{}/profiles/ghost/start", c.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn shutdown_route_notifies() {
        let c = control().await;
        let notified = c.state.shutdown.clone();
        let wait = tokio::spawn(async move { notified.notified().await });
        let resp = reqwest::Client::new()
            .post(format!("{}/shutdown", c.base))
            .send()
            .await
            .unwrap();
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "shutting down");
        tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .unwrap()
            .unwrap();
    }
}
