//! HTTP bridge for out-of-process tool hosts (MCP servers)
//!
//! # Endpoints
//!
//! - `POST /permission` - ask the gate; blocks until resolved or timed out (408)
//! - `GET /pending` - pending request ids
//! - `GET /health` - liveness
//! - `GET /metrics` - Prometheus text exposition

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use super::{ApprovalGate, ApprovalRequest, Decision};
use crate::metrics;
use crate::tools::ToolCategory;

/// Bridge application state
#[derive(Clone)]
pub struct BridgeState {
    pub gate: Arc<ApprovalGate>,
    pub request_timeout: Duration,
}

/// Body of `POST /permission`
#[derive(Debug, Deserialize)]
pub struct PermissionRequest {
    pub tool_id: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PermissionResponse {
    pub approved: bool,
    pub remember: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PendingSummary {
    pub id: Uuid,
    pub tool_id: String,
    pub args: Value,
}

/// Create the bridge router
pub fn create_router(state: BridgeState) -> Router {
    Router::new()
        .route("/permission", post(request_permission))
        .route("/pending", get(list_pending))
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Bind `addr` and serve until the task is dropped
pub async fn serve(addr: SocketAddr, state: BridgeState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Approval bridge listening");
    axum::serve(listener, create_router(state)).await
}

async fn request_permission(
    State(state): State<BridgeState>,
    Json(body): Json<PermissionRequest>,
) -> impl IntoResponse {
    let working_directory = body
        .working_directory
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("/"));
    let request = ApprovalRequest::new(
        body.tool_id.clone(),
        body.tool_id.clone(),
        ToolCategory::infer(&body.tool_id),
        body.args,
        working_directory,
    );

    match state
        .gate
        .request_with_timeout(request, state.request_timeout)
        .await
    {
        Ok(Decision::Approved { remember }) => (
            StatusCode::OK,
            Json(PermissionResponse {
                approved: true,
                remember,
                reason: None,
            }),
        ),
        Ok(Decision::Denied { reason }) => (
            StatusCode::OK,
            Json(PermissionResponse {
                approved: false,
                remember: false,
                reason: Some(reason),
            }),
        ),
        Err(e) => (
            StatusCode::REQUEST_TIMEOUT,
            Json(PermissionResponse {
                approved: false,
                remember: false,
                reason: Some(e.to_string()),
            }),
        ),
    }
}

async fn list_pending(State(state): State<BridgeState>) -> Json<Vec<PendingSummary>> {
    Json(
        state
            .gate
            .pending()
            .into_iter()
            .map(|r| PendingSummary {
                id: r.id,
                tool_id: r.tool_id,
                args: r.args,
            })
            .collect(),
    )
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn prometheus_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_text(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    fn state(timeout: Duration) -> BridgeState {
        BridgeState {
            gate: Arc::new(ApprovalGate::new()),
            request_timeout: timeout,
        }
    }

    fn permission(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/permission")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = create_router(state(Duration::from_secs(1)))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_permission_approved_by_human() {
        let state = state(Duration::from_secs(30));
        let gate = state.gate.clone();
        let mut events = gate.subscribe();
        let approver = tokio::spawn(async move {
            let request = events.recv().await.unwrap();
            assert_eq!(request.category, ToolCategory::Write);
            gate.approve(request.id, true).unwrap();
        });

        let response = create_router(state)
            .oneshot(permission(json!({
                "tool_id": "write_file",
                "args": {"path": "/srv/app/main.rs"},
                "working_directory": "/srv/app"
            })))
            .await
            .unwrap();
        approver.await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: PermissionResponse = body_json(response).await;
        assert_eq!(
            body,
            PermissionResponse {
                approved: true,
                remember: true,
                reason: None
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_timeout_is_408() {
        let state = state(Duration::from_secs(2));
        let gate = state.gate.clone();
        let response = create_router(state)
            .oneshot(permission(json!({"tool_id": "bash", "args": {"command": "ls"}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert!(gate.pending().is_empty());
    }

    #[tokio::test]
    async fn test_pending_lists_waiting_requests() {
        let state = state(Duration::from_secs(30));
        let gate = state.gate.clone();
        let router = create_router(state);

        let waiting = tokio::spawn(
            router
                .clone()
                .oneshot(permission(json!({"tool_id": "bash", "args": {"command": "make"}}))),
        );
        while gate.pending().is_empty() {
            tokio::task::yield_now().await;
        }

        let response = router
            .oneshot(Request::get("/pending").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let pending: Vec<PendingSummary> = body_json(response).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tool_id, "bash");

        gate.deny(pending[0].id, "no").unwrap();
        let denied = waiting.await.unwrap().unwrap();
        let body: PermissionResponse = body_json(denied).await;
        assert!(!body.approved);
        assert_eq!(body.reason.as_deref(), Some("no"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = create_router(state(Duration::from_secs(1)))
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
