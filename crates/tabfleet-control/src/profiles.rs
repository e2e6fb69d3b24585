use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tabfleet_process::ProfileInstanceStatus;

use crate::{
    error::ApiResult,
    instances::{PortField, json_body},
    state::AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct ProfileStartRequest {
    port: Option<PortField>,
    #[serde(default)]
    headless: bool,
}

pub async fn start(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let name = state.profiles.resolve(&id).await?;
    let req: ProfileStartRequest = json_body(&body)?;
    let port = PortField::resolve(req.port.as_ref())?;
    let inst = state.orchestrator.launch(&name, port, req.headless).await?;
    Ok((StatusCode::CREATED, Json(inst)).into_response())
}

pub async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let name = state.profiles.resolve(&id).await?;
    state.orchestrator.stop_profile(&name).await?;
    Ok(Json(json!({"status": "stopped", "id": id, "name": name})))
}

/// Status of the profile's most relevant instance. Unknown profiles read as
/// stopped rather than 404.
pub async fn instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<ProfileInstanceStatus> {
    let name = state.profiles.resolve(&id).await.unwrap_or(id);
    Json(state.orchestrator.profile_status(&name).await)
}
