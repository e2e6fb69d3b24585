//! Tab-addressed routes. The owning instance is looked up on every request
//! by asking each running worker for its tab list.

use axum::{
    Json,
    extract::{Path, Request, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tabfleet_process::Instance;

use crate::{
    error::{ApiError, ApiResult},
    proxy,
    state::AppState,
};

async fn owner(state: &AppState, tab_id: &str) -> ApiResult<Instance> {
    if tab_id.is_empty() {
        return Err(ApiError::bad_request("tab id required"));
    }
    Ok(state.orchestrator.find_instance_by_tab(tab_id).await?)
}

pub async fn close(State(state): State<AppState>, Path(tab_id): Path<String>) -> Response {
    let inst = match owner(&state, &tab_id).await {
        Ok(inst) => inst,
        Err(e) => return e.into_response(),
    };
    proxy::post_tab_command(
        &state.proxy,
        inst.port,
        None,
        HeaderMap::new(),
        &json!({"action": "close", "tabId": tab_id}),
    )
    .await
}

/// Forwards the request path and query unchanged to the tab's owner.
pub async fn proxy(
    State(state): State<AppState>,
    Path(tab_id): Path<String>,
    req: Request,
) -> Response {
    let inst = match owner(&state, &tab_id).await {
        Ok(inst) => inst,
        Err(e) => return e.into_response(),
    };
    let target = proxy::worker_target(inst.port, &proxy::path_and_query(&req));
    proxy::proxy_to_url(&state.proxy, &target, req).await
}

/// Shorthand routes go to the first running instance.
pub async fn shorthand(State(state): State<AppState>, req: Request) -> Response {
    let Some(inst) = state.orchestrator.running_instances().await.into_iter().next() else {
        return ApiError::not_running("no running instances").into_response();
    };
    let target = proxy::worker_target(inst.port, &proxy::path_and_query(&req));
    proxy::proxy_to_url(&state.proxy, &target, req).await
}

/// `GET /tabs` stays answerable with an empty list when nothing runs.
pub async fn shorthand_tabs(State(state): State<AppState>, req: Request) -> Response {
    if state.orchestrator.running_instances().await.is_empty() {
        return Json(json!({"tabs": []})).into_response();
    }
    shorthand(State(state), req).await
}
