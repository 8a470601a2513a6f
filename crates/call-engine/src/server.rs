//! # HTTP Surfaces
//!
//! Two routers, served on separate listeners by the `distributor` binary:
//!
//! - **distributor**: `GET /health` with pool size and loop counters
//! - **agent gateway**:
//!   - `GET /ws/assigned?token=<jwt>` (alias `/ws`) upgrades an authenticated
//!     agent to a WebSocket driven by a [`DeliveryBridge`]
//!   - `GET /api/v1/calls` lists the caller's assigned calls
//!   - `POST /api/v1/calls/:id/complete` sets the status and notes of one of them
//!   - `GET /health` reports live bridges
//!
//! Credentials are checked before the upgrade, so a bad token is answered
//! with `401` and never reaches the bridge. The call endpoints take a bearer
//! token and answer with a `{"success": ..}` envelope.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::broker::EventSubscriber;
use crate::delivery::{ws, BridgeRegistry, CredentialVerifier, DeliveryBridge, DEFAULT_GROUP_PREFIX};
use crate::distributor::{AgentStateSynchronizer, CallAssignmentEngine, Distributor};
use crate::error::{CallEngineError, Result};
use crate::pool::AgentPool;
use crate::store::CallRecordStore;
use crate::types::{AgentId, AssignedCall, CallStatus};

/// Agent id whose token may connect but has no calls of its own
pub const ADMIN_AGENT_ID: &str = "admin";

/// Read-only view of a running distributor
#[derive(Clone)]
pub struct DistributorHealth {
    engine: Arc<CallAssignmentEngine>,
    synchronizer: Arc<AgentStateSynchronizer>,
    pool: Arc<dyn AgentPool>,
}

impl DistributorHealth {
    pub fn new(distributor: &Distributor) -> Self {
        Self {
            engine: distributor.engine().clone(),
            synchronizer: distributor.synchronizer().clone(),
            pool: distributor.pool().clone(),
        }
    }
}

pub fn distributor_router(health: DistributorHealth) -> Router {
    Router::new()
        .route("/health", get(distributor_health))
        .layer(TraceLayer::new_for_http())
        .with_state(health)
}

async fn distributor_health(State(health): State<DistributorHealth>) -> Response {
    let assignment = health.engine.stats();
    let agent_sync = health.synchronizer.stats();

    match health.pool.snapshot().await {
        Ok(agents) => Json(json!({
            "status": "ok",
            "service": "distributor",
            "assignment_mode": health.engine.mode(),
            "available_agents": agents.len(),
            "assignment": assignment,
            "agent_sync": agent_sync,
        }))
        .into_response(),
        Err(e) => {
            warn!("Health check could not read the agent pool: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "service": "distributor",
                    "error": e.to_string(),
                    "assignment": assignment,
                    "agent_sync": agent_sync,
                })),
            )
                .into_response()
        }
    }
}

/// Shared state of the agent gateway
#[derive(Clone)]
pub struct AgentGatewayState {
    subscriber: Arc<dyn EventSubscriber>,
    store: Arc<dyn CallRecordStore>,
    verifier: CredentialVerifier,
    registry: BridgeRegistry,
    group_prefix: String,
    shutdown: CancellationToken,
}

impl AgentGatewayState {
    pub fn new(
        subscriber: Arc<dyn EventSubscriber>,
        store: Arc<dyn CallRecordStore>,
        verifier: CredentialVerifier,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            subscriber,
            store,
            verifier,
            registry: BridgeRegistry::new(),
            group_prefix: DEFAULT_GROUP_PREFIX.to_string(),
            shutdown,
        }
    }

    pub fn with_group_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.group_prefix = prefix.into();
        self
    }

    pub fn registry(&self) -> &BridgeRegistry {
        &self.registry
    }

    /// Query token first, then the `Authorization` header
    pub fn authenticate(&self, token: Option<&str>, authorization: Option<&str>) -> Result<AgentId> {
        match (token, authorization) {
            (Some(token), _) if !token.is_empty() => self.verifier.verify(token),
            (_, Some(header)) => self.verifier.verify_bearer(header),
            _ => Err(CallEngineError::authentication("missing token")),
        }
    }

    pub fn bridge(&self, agent_id: AgentId) -> DeliveryBridge {
        DeliveryBridge::new(
            agent_id,
            self.subscriber.clone(),
            self.registry.clone(),
            self.shutdown.clone(),
        )
        .with_group_prefix(&self.group_prefix)
    }
}

pub fn agent_router(state: AgentGatewayState) -> Router {
    Router::new()
        .route("/ws/assigned", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/api/v1/calls", get(list_calls))
        .route("/api/v1/calls/:id/complete", post(complete_call))
        .route("/health", get(agent_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_handler(
    State(state): State<AgentGatewayState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let agent_id = match state.authenticate(query.token.as_deref(), authorization) {
        Ok(agent_id) => agent_id,
        Err(e) => {
            warn!("Rejected agent connection: {}", e);
            return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Invalid token" }))).into_response();
        }
    };

    let Some(upgrade) = upgrade else {
        return (
            StatusCode::UPGRADE_REQUIRED,
            Json(json!({ "error": "WebSocket upgrade required" })),
        )
            .into_response();
    };

    upgrade.on_upgrade(move |socket| async move {
        let (sink, source) = ws::split(socket);
        state.bridge(agent_id).run(sink, source).await;
    })
}

/// Envelope of every call endpoint response
#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn api_ok<T: Serialize>(message: Option<&str>, data: T) -> Response {
    Json(ApiResponse {
        success: true,
        message: message.map(str::to_string),
        data: Some(data),
        error: None,
    })
    .into_response()
}

fn api_error(status: StatusCode, message: &str, error: impl ToString) -> Response {
    let body: ApiResponse<()> = ApiResponse {
        success: false,
        message: Some(message.to_string()),
        data: None,
        error: Some(error.to_string()),
    };
    (status, Json(body)).into_response()
}

fn bearer_agent(state: &AgentGatewayState, headers: &HeaderMap) -> std::result::Result<AgentId, Response> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            api_error(StatusCode::UNAUTHORIZED, "Authorization header required", "missing token")
        })?;
    state
        .verifier
        .verify_bearer(authorization)
        .map_err(|e| api_error(StatusCode::UNAUTHORIZED, "Invalid token", e))
}

async fn list_calls(State(state): State<AgentGatewayState>, headers: HeaderMap) -> Response {
    let agent_id = match bearer_agent(&state, &headers) {
        Ok(agent_id) => agent_id,
        Err(response) => return response,
    };
    if agent_id.as_str() == ADMIN_AGENT_ID {
        return api_ok(None, Vec::<AssignedCall>::new());
    }

    match state.store.assigned_calls_for_agent(&agent_id).await {
        Ok(calls) => api_ok(None, calls),
        Err(e) => {
            warn!(agent_id = %agent_id, "Failed to list assigned calls: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to get calls", e)
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompleteCallRequest {
    #[serde(default)]
    notes: String,
    status: String,
}

async fn complete_call(
    State(state): State<AgentGatewayState>,
    Path(call_id): Path<String>,
    headers: HeaderMap,
    body: std::result::Result<Json<CompleteCallRequest>, JsonRejection>,
) -> Response {
    let agent_id = match bearer_agent(&state, &headers) {
        Ok(agent_id) => agent_id,
        Err(response) => return response,
    };
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => return api_error(StatusCode::BAD_REQUEST, "Invalid request body", rejection),
    };
    let Some(status) = CallStatus::parse(&request.status) else {
        return api_error(
            StatusCode::BAD_REQUEST,
            "Invalid request body",
            format!("unknown status {:?}", request.status),
        );
    };

    match state
        .store
        .complete_call(&call_id, &agent_id, status, &request.notes)
        .await
    {
        Ok(call) => {
            info!(agent_id = %agent_id, call_id = %call_id, status = %status, "Call updated");
            api_ok(Some("Call completed successfully"), call)
        }
        Err(e @ CallEngineError::NotFound(_)) => api_error(StatusCode::NOT_FOUND, "Call not found", e),
        Err(e @ CallEngineError::Authorization(_)) => {
            api_error(StatusCode::FORBIDDEN, "Call is assigned to another agent", e)
        }
        Err(e) => {
            warn!(agent_id = %agent_id, call_id = %call_id, "Failed to complete call: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to complete call", e)
        }
    }
}

async fn agent_health(State(state): State<AgentGatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "customer-agent",
        "live_bridges": state.registry.total(),
        "connected_agents": state.registry.agents(),
        "connections": state.registry.snapshot(),
    }))
}

/// Serve a router until `shutdown` is cancelled
pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_err(|e| CallEngineError::internal(format!("listener address: {}", e)))?;
    info!("🌐 Listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| CallEngineError::internal(format!("server on {} failed: {}", addr, e)))
}
