use crate::response::ApiResponse;
use crate::{AppState, Result};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use gpushare_core::DeviceUsage;
use gpushare_scheduler::PodInfo;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// GET /nodes
pub async fn list_nodes(State(state): State<Arc<AppState>>) -> Result<Response> {
    let nodes: BTreeMap<String, Vec<DeviceUsage>> = state
        .scheduler
        .nodes()
        .list_nodes()
        .into_iter()
        .map(|(name, usage)| (name, usage.devices))
        .collect();

    Ok(ApiResponse::ok(nodes).into_response())
}

/// Devices of one node and the pods holding grants on it
#[derive(Serialize)]
struct NodeDetail {
    devices: Vec<DeviceUsage>,
    pods: Vec<PodInfo>,
}

/// GET /nodes/{name}
pub async fn get_node(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response> {
    let usage = state.scheduler.nodes().get_node(&name)?;
    let detail = NodeDetail {
        devices: usage.devices,
        pods: state.scheduler.pods().pods_on(&name),
    };

    Ok(ApiResponse::ok(detail).into_response())
}

/// GET /pods
pub async fn list_pods(State(state): State<Arc<AppState>>) -> Result<Response> {
    Ok(ApiResponse::ok(state.scheduler.pods().list_pods()).into_response())
}
