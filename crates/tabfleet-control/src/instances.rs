use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, RawQuery, Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use tabfleet_agent::validation::parse_port;
use tabfleet_process::{Instance, InstanceId, InstanceStatus, InstanceTab};
use tracing::info;

use crate::{
    error::{ApiError, ApiResult},
    proxy,
    state::AppState,
};

/// Port as sent by clients: either a JSON number or a numeric string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PortField {
    Number(u32),
    Text(String),
}

impl PortField {
    pub fn resolve(field: Option<&PortField>) -> ApiResult<Option<u16>> {
        let raw = match field {
            None => return Ok(None),
            Some(PortField::Number(n)) => n.to_string(),
            Some(PortField::Text(s)) => s.clone(),
        };
        Ok(parse_port(&raw)?)
    }
}

/// Parses an optional JSON body; an empty body yields the default.
pub fn json_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|_| ApiError::bad_request("invalid JSON"))
}

fn generated_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("instance-{nanos}")
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchRequest {
    pub profile_id: Option<String>,
    pub name: Option<String>,
    pub mode: Option<String>,
    pub port: Option<PortField>,
}

impl LaunchRequest {
    fn headless(&self) -> bool {
        self.mode.as_deref() != Some("headed")
    }
}

async fn launch_from(state: &AppState, req: LaunchRequest, allow_name: bool) -> ApiResult<Response> {
    let port = PortField::resolve(req.port.as_ref())?;
    let name = match req.profile_id.as_deref().filter(|s| !s.is_empty()) {
        Some(profile) => state.profiles.resolve(profile).await?,
        None => match req.name.as_deref().filter(|s| allow_name && !s.is_empty()) {
            Some(name) => name.to_string(),
            None => generated_name(),
        },
    };

    let inst = state
        .orchestrator
        .launch(&name, port, req.headless())
        .await?;
    info!(id = %inst.id, port = inst.port, "instance launch accepted");
    Ok((StatusCode::CREATED, Json(inst)).into_response())
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<Instance>> {
    Json(state.orchestrator.list().await)
}

pub async fn all_tabs(State(state): State<AppState>) -> Json<Vec<InstanceTab>> {
    Json(state.orchestrator.all_tabs().await)
}

pub async fn launch(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    launch_from(&state, json_body(&body)?, true).await
}

pub async fn start(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    launch_from(&state, json_body(&body)?, false).await
}

pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Instance>> {
    Ok(Json(state.orchestrator.get(&InstanceId(id)).await?))
}

pub async fn restart(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let inst = state.orchestrator.restart(&InstanceId(id)).await?;
    Ok((StatusCode::CREATED, Json(inst)).into_response())
}

pub async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.orchestrator.stop(&InstanceId(id.clone())).await?;
    Ok(Json(json!({"status": "stopped", "id": id})))
}

pub async fn logs(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let logs = state.orchestrator.logs(&InstanceId(id)).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], logs).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreencastQuery {
    tab_id: Option<String>,
}

pub async fn screencast_url(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ScreencastQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let tab_id = q
        .tab_id
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::bad_request("tabId is required"))?;
    let url = state
        .orchestrator
        .screencast_url(&InstanceId(id), &tab_id)
        .await?;
    Ok(Json(json!({"wsUrl": url})))
}

/// Looks up an instance that can take proxied traffic: unknown ids are 404,
/// anything not running is 503.
async fn running_instance(state: &AppState, id: &str) -> ApiResult<Instance> {
    let inst = state.orchestrator.get(&InstanceId(id.to_string())).await?;
    if inst.status != InstanceStatus::Running {
        return Err(ApiError::not_running(format!(
            "instance {id:?} is not running (status: {})",
            inst.status
        )));
    }
    Ok(inst)
}

/// Forwards `/instances/{id}/<rest>` to `/<rest>` on the instance.
pub async fn proxy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    req: Request,
) -> Response {
    let inst = match running_instance(&state, &id).await {
        Ok(inst) => inst,
        Err(e) => return e.into_response(),
    };
    let Some(rest) = instance_subpath(req.uri().path()) else {
        return ApiError::bad_request("path is not under /instances/{id}").into_response();
    };
    let mut path = rest.to_string();
    if let Some(q) = req.uri().query() {
        path.push('?');
        path.push_str(q);
    }
    let target = proxy::worker_target(inst.port, &path);
    proxy::proxy_to_url(&state.proxy, &target, req).await
}

/// Worker-side path for a raw `/instances/{id}/<rest>` path. The id is one
/// segment in whatever encoding the client used, so the split happens on
/// the raw path rather than on the decoded id.
fn instance_subpath(raw_path: &str) -> Option<&str> {
    let after = raw_path.strip_prefix("/instances/")?;
    let slash = after.find('/')?;
    (slash > 0).then(|| &after[slash..])
}

#[derive(Debug, Default, Deserialize)]
pub struct TabOpenRequest {
    #[serde(default)]
    url: String,
}

pub async fn open_tab(
    State(state): State<AppState>,
    Path(id): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let inst = match running_instance(&state, &id).await {
        Ok(inst) => inst,
        Err(e) => return e.into_response(),
    };
    let req: TabOpenRequest = match json_body(&body) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    proxy::post_tab_command(
        &state.proxy,
        inst.port,
        query.as_deref(),
        headers,
        &json!({"action": "new", "url": req.url}),
    )
    .await
}
