//! API handlers for the HTTP REST API

use std::sync::Arc;

use axum::{
    async_trait,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        FromRequestParts, Path, Query, State,
    },
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::alerting::{AlertLifecycleManager, BroadcastSink, CycleReport, WorkOrderSpawn};
use crate::error::Error;
use crate::models::{
    Alert, AlertAcknowledgment, AlertFilter, AlertInput, AlertNotification, AlertPage, AlertRule,
    AlertRuleInput, AlertRuleUpdate, WorkOrder, WorkOrderInput,
};

/// Header carrying the caller's tenant, set by the authentication layer
pub const TENANT_HEADER: &str = "x-tenant-id";
/// Header carrying the caller's user id
pub const USER_HEADER: &str = "x-user-id";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<AlertLifecycleManager>,
    pub broadcast: Arc<BroadcastSink>,
}

/// Error returned by handlers
#[derive(Debug)]
pub enum ApiError {
    /// Missing or malformed identity headers
    Unauthorized(String),
    /// Engine error
    Core(Error),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self::Core(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            Self::Core(err) => {
                let status = match &err {
                    Error::Validation(_) => StatusCode::BAD_REQUEST,
                    Error::NotFound { .. } => StatusCode::NOT_FOUND,
                    Error::InvalidTransition { .. } | Error::Conflict(_) => StatusCode::CONFLICT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    error!(error = %err, "Request failed");
                }
                (status, err.to_string())
            }
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Caller identity forwarded in request headers
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
}

impl Identity {
    /// The calling user, required for actions that are attributed
    pub fn user(&self) -> ApiResult<Uuid> {
        self.user_id
            .ok_or_else(|| ApiError::Unauthorized(format!("missing {USER_HEADER} header")))
    }
}

fn header_uuid(parts: &Parts, name: &str) -> ApiResult<Option<Uuid>> {
    let Some(value) = parts.headers.get(name) else {
        return Ok(None);
    };

    value
        .to_str()
        .ok()
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .map(Some)
        .ok_or_else(|| ApiError::Unauthorized(format!("invalid {name} header")))
}

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> ApiResult<Self> {
        let tenant_id = header_uuid(parts, TENANT_HEADER)?
            .ok_or_else(|| ApiError::Unauthorized(format!("missing {TENANT_HEADER} header")))?;
        let user_id = header_uuid(parts, USER_HEADER)?;

        Ok(Self { tenant_id, user_id })
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============================================================================
// Alert rules
// ============================================================================

/// List the tenant's alert rules
pub async fn list_alert_rules(
    State(state): State<AppState>,
    identity: Identity,
) -> ApiResult<Json<Vec<AlertRule>>> {
    Ok(Json(state.manager.list_rules(identity.tenant_id).await?))
}

/// Create an alert rule
pub async fn create_alert_rule(
    State(state): State<AppState>,
    identity: Identity,
    Json(input): Json<AlertRuleInput>,
) -> ApiResult<(StatusCode, Json<AlertRule>)> {
    let rule = state.manager.create_rule(identity.tenant_id, input).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

/// Get a single alert rule
pub async fn get_alert_rule(
    State(state): State<AppState>,
    identity: Identity,
    Path(rule_id): Path<Uuid>,
) -> ApiResult<Json<AlertRule>> {
    Ok(Json(state.manager.get_rule(identity.tenant_id, rule_id).await?))
}

/// Update an alert rule; omitted fields keep their value
pub async fn update_alert_rule(
    State(state): State<AppState>,
    identity: Identity,
    Path(rule_id): Path<Uuid>,
    Json(update): Json<AlertRuleUpdate>,
) -> ApiResult<Json<AlertRule>> {
    let rule = state
        .manager
        .update_rule(identity.tenant_id, rule_id, update)
        .await?;
    Ok(Json(rule))
}

/// Delete an alert rule
pub async fn delete_alert_rule(
    State(state): State<AppState>,
    identity: Identity,
    Path(rule_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.manager.delete_rule(identity.tenant_id, rule_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Alerts
// ============================================================================

/// List alerts, newest first, with the total count of matches
pub async fn list_alerts(
    State(state): State<AppState>,
    identity: Identity,
    Query(filter): Query<AlertFilter>,
) -> ApiResult<Json<AlertPage>> {
    Ok(Json(
        state.manager.list_alerts(identity.tenant_id, &filter).await?,
    ))
}

/// Create a manual alert
pub async fn create_alert(
    State(state): State<AppState>,
    identity: Identity,
    Json(input): Json<AlertInput>,
) -> ApiResult<(StatusCode, Json<Alert>)> {
    let alert = state.manager.create_alert(identity.tenant_id, input).await?;
    Ok((StatusCode::CREATED, Json(alert)))
}

/// Alert with its audit trail
#[derive(Serialize)]
pub struct AlertDetail {
    #[serde(flatten)]
    pub alert: Alert,
    pub acknowledgments: Vec<AlertAcknowledgment>,
    pub work_orders: Vec<WorkOrder>,
}

/// Get a single alert
pub async fn get_alert(
    State(state): State<AppState>,
    identity: Identity,
    Path(alert_id): Path<Uuid>,
) -> ApiResult<Json<AlertDetail>> {
    let alert = state.manager.get_alert(identity.tenant_id, alert_id).await?;
    let acknowledgments = state
        .manager
        .list_acknowledgments(identity.tenant_id, alert_id)
        .await?;
    let work_orders = state
        .manager
        .list_work_orders(identity.tenant_id, alert_id)
        .await?;

    Ok(Json(AlertDetail {
        alert,
        acknowledgments,
        work_orders,
    }))
}

/// Optional note attached to an acknowledge or close
#[derive(Debug, Default, Deserialize)]
pub struct NoteRequest {
    pub note: Option<String>,
}

/// Acknowledge an alert
pub async fn acknowledge_alert(
    State(state): State<AppState>,
    identity: Identity,
    Path(alert_id): Path<Uuid>,
    body: Option<Json<NoteRequest>>,
) -> ApiResult<Json<Alert>> {
    let user_id = identity.user()?;
    let note = body.and_then(|Json(req)| req.note);

    let alert = state
        .manager
        .acknowledge(identity.tenant_id, alert_id, user_id, note)
        .await?;
    Ok(Json(alert))
}

/// Body for resolving an alert
#[derive(Debug, Default, Deserialize)]
pub struct ResolveRequest {
    pub resolution_notes: Option<String>,
}

/// Resolve an alert
pub async fn resolve_alert(
    State(state): State<AppState>,
    identity: Identity,
    Path(alert_id): Path<Uuid>,
    body: Option<Json<ResolveRequest>>,
) -> ApiResult<Json<Alert>> {
    let notes = body.and_then(|Json(req)| req.resolution_notes);

    let alert = state
        .manager
        .resolve(identity.tenant_id, alert_id, identity.user_id, notes)
        .await?;
    Ok(Json(alert))
}

/// Close an alert
pub async fn close_alert(
    State(state): State<AppState>,
    identity: Identity,
    Path(alert_id): Path<Uuid>,
    body: Option<Json<NoteRequest>>,
) -> ApiResult<Json<Alert>> {
    let note = body.and_then(|Json(req)| req.note);

    let alert = state
        .manager
        .close(identity.tenant_id, alert_id, note)
        .await?;
    Ok(Json(alert))
}

/// Spawn a work order from an alert
pub async fn create_work_order(
    State(state): State<AppState>,
    identity: Identity,
    Path(alert_id): Path<Uuid>,
    body: Option<Json<WorkOrderInput>>,
) -> ApiResult<(StatusCode, Json<WorkOrderSpawn>)> {
    let user_id = identity.user()?;
    let input = body.map(|Json(input)| input).unwrap_or_default();

    let spawned = state
        .manager
        .spawn_work_order(identity.tenant_id, alert_id, user_id, input)
        .await?;
    Ok((StatusCode::CREATED, Json(spawned)))
}

/// Run an evaluation cycle for the caller's tenant now
pub async fn evaluate_alerts(
    State(state): State<AppState>,
    identity: Identity,
) -> ApiResult<Json<CycleReport>> {
    Ok(Json(
        state.manager.run_evaluation_cycle(identity.tenant_id).await?,
    ))
}

// ============================================================================
// Real-time streaming
// ============================================================================

/// Stream the tenant's alert events over a WebSocket
pub async fn alert_stream(
    State(state): State<AppState>,
    identity: Identity,
    ws: WebSocketUpgrade,
) -> Response {
    let events = state.broadcast.subscribe(identity.tenant_id);
    let tenant_id = identity.tenant_id;
    ws.on_upgrade(move |socket| forward_events(socket, events, tenant_id))
}

async fn forward_events(
    mut socket: WebSocket,
    mut events: broadcast::Receiver<AlertNotification>,
    tenant_id: Uuid,
) {
    debug!(%tenant_id, "Alert stream opened");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(notification) => {
                    let text = match serde_json::to_string(&notification) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode alert event");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%tenant_id, skipped, "Alert stream subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) if text == "ping" => {
                    if socket.send(Message::Text("pong".to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!(%tenant_id, "Alert stream closed");
}
