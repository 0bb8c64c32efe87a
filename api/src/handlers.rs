use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use consensus::{ConsensusManager, NodeStatus, Service};

use crate::{ApiError, ApiResult};

pub struct AppState {
    pub consensus_manager: Arc<ConsensusManager>,
}

#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    /// One key, or several separated by commas.
    k: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NodeQuery {
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ServiceQuery {
    name: Option<String>,
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub async fn get_kv(
    State(state): State<Arc<AppState>>,
    Query(query): Query<KeyQuery>,
) -> ApiResult<Response> {
    let manager = &state.consensus_manager;
    match query.k {
        Some(key) => {
            let value = manager.get(&key).await.ok_or(ApiError::NoSuchKey(key.clone()))?;
            Ok(Json(json!({ "key": key, "value": value })).into_response())
        }
        None => Ok(Json(manager.entries().await).into_response()),
    }
}

pub async fn set_kv(
    State(state): State<Arc<AppState>>,
    Json(items): Json<HashMap<String, String>>,
) -> ApiResult<Response> {
    if items.is_empty() {
        return Err(ApiError::InvalidRequest("No items given".to_string()));
    }
    let count = items.len();
    state.consensus_manager.set(items).await?;
    Ok(Json(json!({ "updated": count })).into_response())
}

pub async fn delete_kv(
    State(state): State<Arc<AppState>>,
    Query(query): Query<KeyQuery>,
) -> ApiResult<Response> {
    let keys = query.k.as_deref().map(split_list).unwrap_or_default();
    if keys.is_empty() {
        return Err(ApiError::InvalidRequest("Missing parameter k".to_string()));
    }
    let count = keys.len();
    state.consensus_manager.remove(keys).await?;
    Ok(Json(json!({ "removed": count })).into_response())
}

pub async fn get_nodes(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let manager = &state.consensus_manager;
    Ok(Json(json!({
        "local": manager.local_info().await,
        "leader": manager.get_leader().await,
        "peers": manager.list_peers().await,
    }))
    .into_response())
}

pub async fn add_nodes(
    State(state): State<Arc<AppState>>,
    Json(addrs): Json<Vec<String>>,
) -> ApiResult<Response> {
    if addrs.is_empty() {
        return Err(ApiError::InvalidRequest("No addresses given".to_string()));
    }
    let reached = state.consensus_manager.add_peers(addrs).await?;
    Ok(Json(json!({ "reached": reached })).into_response())
}

pub async fn delete_nodes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NodeQuery>,
) -> ApiResult<Response> {
    let addrs = query.ip.as_deref().map(split_list).unwrap_or_default();
    if addrs.is_empty() {
        return Err(ApiError::InvalidRequest("Missing parameter ip".to_string()));
    }
    let removed = state.consensus_manager.remove_peers(addrs).await?;
    Ok(Json(json!({ "removed": removed })).into_response())
}

pub async fn get_service(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ServiceQuery>,
) -> ApiResult<Response> {
    let manager = &state.consensus_manager;
    match query.name {
        Some(name) => {
            let service = manager
                .get_service(&name)
                .await
                .ok_or(ApiError::NoSuchService(name))?;
            Ok(Json(service).into_response())
        }
        None => Ok(Json(manager.services().await).into_response()),
    }
}

pub async fn set_service(
    State(state): State<Arc<AppState>>,
    Json(service): Json<Service>,
) -> ApiResult<Response> {
    if service.name.is_empty() {
        return Err(ApiError::InvalidRequest("Service name is required".to_string()));
    }
    state.consensus_manager.set_service(service).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn delete_service(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ServiceQuery>,
) -> ApiResult<Response> {
    let name = query
        .name
        .ok_or_else(|| ApiError::InvalidRequest("Missing parameter name".to_string()))?;
    state.consensus_manager.remove_service(&name).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn balance(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ServiceQuery>,
) -> ApiResult<Response> {
    let name = query
        .name
        .ok_or_else(|| ApiError::InvalidRequest("Missing parameter name".to_string()))?;
    let endpoint = state.consensus_manager.select_service_endpoint(&name).await?;
    Ok(Json(endpoint).into_response())
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let manager = &state.consensus_manager;
    let local = manager.local_info().await;
    let alive = manager
        .list_peers()
        .await
        .iter()
        .filter(|p| p.status == NodeStatus::Alive)
        .count();

    Ok(Json(json!({
        "status": "ok",
        "id": local.id,
        "role": local.raft_role.to_string(),
        "leader": manager.get_leader().await.map(|l| l.id),
        "alive_peers": alive,
        "version": local.version,
    }))
    .into_response())
}
