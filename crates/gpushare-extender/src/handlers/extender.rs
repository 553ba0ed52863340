use crate::response::ApiResponse;
use crate::types::{
    ExtenderArgs, ExtenderBindingArgs, ExtenderBindingResult, ExtenderFilterResult,
    ExtenderNodeList,
};
use crate::{AppState, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gpushare_core::PodExt;
use gpushare_scheduler::FilterOutcome;
use std::sync::Arc;
use tracing::{error, info};

/// POST /filter
pub async fn filter(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<ExtenderArgs>, JsonRejection>,
) -> Result<Response> {
    let Json(args) = body?;
    let candidates = args.candidate_names();
    info!(pod = %args.pod.key(), candidates = candidates.len(), "Filter request");

    let result = match state.scheduler.filter(&args.pod, &candidates).await {
        Ok(outcome) => filter_result(&args, outcome),
        Err(e) => {
            error!(pod = %args.pod.key(), "Filter failed: {}", e);
            ExtenderFilterResult::error(e.to_string())
        }
    };

    Ok(ApiResponse::ok(result).into_response())
}

/// Answer in the shape the caller asked in: names, or full node objects
fn filter_result(args: &ExtenderArgs, outcome: FilterOutcome) -> ExtenderFilterResult {
    let FilterOutcome {
        node_names,
        failed_nodes,
        error,
    } = outcome;

    let mut result = ExtenderFilterResult {
        failed_nodes,
        error: error.unwrap_or_default(),
        ..Default::default()
    };
    match (&args.node_names, &args.nodes) {
        (None, Some(list)) => {
            let items = list
                .items
                .iter()
                .filter(|n| {
                    n.metadata
                        .name
                        .as_ref()
                        .is_some_and(|name| node_names.contains(name))
                })
                .cloned()
                .collect();
            result.nodes = Some(ExtenderNodeList { items });
        }
        _ => result.node_names = Some(node_names),
    }
    result
}

/// POST /bind
pub async fn bind(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<ExtenderBindingArgs>, JsonRejection>,
) -> Result<Response> {
    let Json(args) = body?;
    info!(
        pod = %format!("{}/{}", args.pod_namespace, args.pod_name),
        node = %args.node,
        "Bind request"
    );

    let result = match state
        .scheduler
        .bind(&args.pod_namespace, &args.pod_name, &args.pod_uid, &args.node)
        .await
    {
        Ok(()) => ExtenderBindingResult::default(),
        Err(e) => ExtenderBindingResult {
            error: e.to_string(),
        },
    };

    Ok(ApiResponse::ok(result).into_response())
}
