//! Host HTTP endpoints under `/.well-known/workflow/v1/`.
//!
//! The flow and step endpoints are queue-backed: a request is converted into
//! the corresponding queue message and acknowledged; all semantics live in
//! the queue handlers. The webhook endpoint delivers hook payloads by token,
//! and the manifest endpoint serves the build-produced manifest. Both
//! invocation endpoints answer `?__health` with `200 text/plain` for
//! HTTP-level liveness; the deeper queue-delivered health check travels with
//! real work instead.

use std::sync::Arc;

use axum::{
    extract::{Path, RawQuery, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::{error, warn};
use utoipa::ToSchema;

use windlass_codec::Value;
use windlass_core::{RunId, WorkflowName};
use windlass_engine::{Runtime, RuntimeError, StepMessage, WorkflowMessage};

/// App state shared across routes.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
    /// Manifest JSON served verbatim.
    pub manifest: Arc<serde_json::Value>,
}

impl AppState {
    /// Builds state, resolving the manifest from the environment
    /// (`WORKFLOW_PUBLIC_MANIFEST` inline, then `WORKFLOW_MANIFEST_PATH`,
    /// then the registry).
    pub fn new(runtime: Arc<Runtime>, config: &windlass_world::WorldConfig) -> Self {
        let manifest = resolve_manifest(&runtime, config);
        Self {
            runtime,
            manifest: Arc::new(manifest),
        }
    }
}

fn resolve_manifest(
    runtime: &Arc<Runtime>,
    config: &windlass_world::WorldConfig,
) -> serde_json::Value {
    if let Some(inline) = &config.public_manifest {
        match serde_json::from_str(inline) {
            Ok(manifest) => return manifest,
            Err(e) => warn!(%e, "WORKFLOW_PUBLIC_MANIFEST is not valid JSON, ignoring"),
        }
    }
    if let Some(path) = &config.manifest_path {
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(manifest) => return manifest,
                Err(e) => warn!(%e, path = %path.display(), "manifest file is not valid JSON"),
            },
            Err(e) => warn!(%e, path = %path.display(), "manifest file is unreadable"),
        }
    }
    serde_json::to_value(runtime.manifest()).unwrap_or_else(|_| serde_json::json!({}))
}

/// Create the host routes.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/.well-known/workflow/v1/flow",
            get(http_health).post(invoke_flow),
        )
        .route(
            "/.well-known/workflow/v1/step",
            get(http_health).post(invoke_step),
        )
        .route(
            "/.well-known/workflow/v1/webhook/:token",
            post(deliver_webhook),
        )
        .route("/.well-known/workflow/v1/manifest.json", get(manifest))
        .with_state(state)
}

/// `GET ...?__health` — HTTP-level liveness only.
async fn http_health(RawQuery(query): RawQuery) -> impl IntoResponse {
    if query.as_deref().is_some_and(|q| q.contains("__health")) {
        (StatusCode::OK, "ok").into_response()
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

/// Request to (re)deliver a workflow invocation.
#[derive(Debug, Deserialize, ToSchema)]
pub struct FlowInvocation {
    /// Fully-qualified workflow name.
    #[serde(rename = "workflowName")]
    #[schema(value_type = String)]
    pub workflow_name: WorkflowName,

    /// Run to execute.
    #[serde(rename = "runId")]
    #[schema(value_type = String)]
    pub run_id: RunId,
}

/// POST /.well-known/workflow/v1/flow - enqueue a workflow invocation
#[utoipa::path(
    post,
    path = "/.well-known/workflow/v1/flow",
    request_body = FlowInvocation,
    responses(
        (status = 202, description = "Invocation enqueued"),
        (status = 500, description = "Queue rejected the message")
    ),
    tag = "workflow"
)]
pub async fn invoke_flow(
    State(state): State<AppState>,
    Json(request): Json<FlowInvocation>,
) -> Result<StatusCode, StatusCode> {
    let payload = WorkflowMessage::new(request.run_id)
        .to_bytes()
        .map_err(|e| {
            error!(%e, "failed to encode workflow message");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    state
        .runtime
        .queue()
        .enqueue(
            &request.workflow_name.topic(),
            &request.run_id.to_string(),
            payload,
        )
        .await
        .map_err(|e| {
            error!(%e, "failed to enqueue workflow invocation");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(StatusCode::ACCEPTED)
}

/// POST /.well-known/workflow/v1/step - enqueue a step invocation
#[utoipa::path(
    post,
    path = "/.well-known/workflow/v1/step",
    responses(
        (status = 202, description = "Invocation enqueued"),
        (status = 500, description = "Queue rejected the message")
    ),
    tag = "workflow"
)]
pub async fn invoke_step(
    State(state): State<AppState>,
    Json(message): Json<StepMessage>,
) -> Result<StatusCode, StatusCode> {
    let payload = message.to_bytes().map_err(|e| {
        error!(%e, "failed to encode step message");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    state
        .runtime
        .queue()
        .enqueue(
            &message.step_name.topic(),
            &message.correlation_id.to_string(),
            payload,
        )
        .await
        .map_err(|e| {
            error!(%e, "failed to enqueue step invocation");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(StatusCode::ACCEPTED)
}

/// POST /.well-known/workflow/v1/webhook/{token} - deliver a hook payload
#[utoipa::path(
    post,
    path = "/.well-known/workflow/v1/webhook/{token}",
    params(("token" = String, Path, description = "Hook token")),
    responses(
        (status = 200, description = "Payload delivered"),
        (status = 404, description = "Unknown token"),
        (status = 410, description = "Hook no longer receiving")
    ),
    tag = "workflow"
)]
pub async fn deliver_webhook(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state
        .runtime
        .deliver_hook(&token, Value::from_json(&payload))
        .await
    {
        Ok(static_response) => {
            let body = static_response
                .and_then(|v| v.to_json())
                .unwrap_or_else(|| serde_json::json!({ "ok": true }));
            Ok(Json(body))
        }
        Err(RuntimeError::World(windlass_world::WorldError::UnknownHookToken)) => {
            Err(StatusCode::NOT_FOUND)
        }
        Err(RuntimeError::HookClosed) => Err(StatusCode::GONE),
        Err(e) => {
            error!(%e, "failed to deliver hook payload");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /.well-known/workflow/v1/manifest.json - static manifest
#[utoipa::path(
    get,
    path = "/.well-known/workflow/v1/manifest.json",
    responses((status = 200, description = "Manifest of workflows and steps")),
    tag = "workflow"
)]
pub async fn manifest(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.manifest.as_ref().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[tokio::test]
    async fn health_query_returns_ok() {
        let response = http_health(RawQuery(Some("__health".to_string())))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn invocation_endpoints_reject_plain_get() {
        let response = http_health(RawQuery(None)).await.into_response();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
