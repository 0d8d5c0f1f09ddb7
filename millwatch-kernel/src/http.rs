/**
 * API REST MILLWATCH - Serveur HTTP du kernel
 *
 * RÔLE :
 * Surface fine au-dessus du manager, de l'inspecteur qualité et du
 * broadcaster : lecture d'état machine, commandes, arrêt d'urgence flotte,
 * inspection d'images et flux d'événements temps réel.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, réponses = OperationResult sérialisé
 * - Code HTTP dérivé de l'ErrorCode selon la route
 * - Commandes critiques (emergency_stop, start_program) refusées sans
 *   `safety_confirmation: true`
 * - /api/v1/events : WebSocket, un abonné broadcaster par connexion,
 *   message {"type":"subscribe","data":{...}} = remplacement du filtre
 * - Fin d'un sens (envoi ou réception) = arrêt de l'autre et désabonnement
 */

use crate::controllers::CncCommand;
use crate::events::{ChannelSink, EventBroadcaster, SubscriptionFilter};
use crate::health::{HealthTracker, KernelHealth};
use crate::manager::MachineManager;
use crate::models::event::QUALITY_INSPECTION;
use crate::models::{ErrorCode, InspectionResult, ManufacturingEvent, OperationResult, Priority};
use crate::vision::{Image, QualityInspector, RegionOfInterest};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const INSPECTOR_COMPONENT: &str = "quality-inspector";

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<MachineManager>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub inspector: Arc<QualityInspector>,
    pub health_tracker: HealthTracker,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/api/v1/machines", get(list_machines))
        .route("/api/v1/machines/{id}", get(get_machine))
        .route("/api/v1/machines/{id}/history", get(get_history))
        .route("/api/v1/machines/{id}/command", post(post_command))
        .route("/api/v1/emergency-stop", post(post_emergency_stop))
        .route("/api/v1/quality/inspect", post(post_inspect))
        .route("/api/v1/events", get(events_socket))
        .with_state(app_state)
}

fn respond<T: Serialize>(outcome: OperationResult<T>, status_of: fn(ErrorCode) -> StatusCode) -> Response {
    let status = outcome.error_code().map_or(StatusCode::OK, status_of);
    (status, Json(outcome)).into_response()
}

fn machine_status_code(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::UnknownMachine => StatusCode::NOT_FOUND,
        ErrorCode::StatusUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn command_status_code(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::UnknownMachine => StatusCode::NOT_FOUND,
        ErrorCode::NotSupported => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn inspection_status_code(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidImage => StatusCode::BAD_REQUEST,
        ErrorCode::PreprocessingFailed | ErrorCode::DetectionFailed => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health(&app.manager, &app.broadcaster, &app.inspector))
}

// GET /api/v1/machines
async fn list_machines(State(app): State<AppState>) -> Response {
    respond(app.manager.get_all_status(), machine_status_code)
}

// GET /api/v1/machines/{id}
async fn get_machine(State(app): State<AppState>, Path(id): Path<String>) -> Response {
    respond(app.manager.get_status(&id), machine_status_code)
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

// GET /api/v1/machines/{id}/history?limit=
async fn get_history(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Response {
    respond(app.manager.history(&id, params.limit), machine_status_code)
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: CncCommand,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub safety_confirmation: bool,
}

// POST /api/v1/machines/{id}/command
async fn post_command(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> Response {
    if req.command.is_safety_critical() && !req.safety_confirmation {
        warn!(machine_id = %id, command = req.command.as_str(), "critical command without safety confirmation");
        let body = serde_json::json!({
            "success": false,
            "error": format!("{} requires safety_confirmation", req.command),
        });
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    }

    info!(machine_id = %id, command = req.command.as_str(), "command requested");
    respond(app.manager.send_command(&id, req.command, req.parameters).await, command_status_code)
}

// POST /api/v1/emergency-stop
async fn post_emergency_stop(State(app): State<AppState>) -> Response {
    respond(app.manager.emergency_stop_all().await, |_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[derive(Debug, Deserialize)]
pub struct InspectRequest {
    pub part_id: String,
    pub width: usize,
    pub height: usize,
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Pixels bruts entrelacés, base64 standard
    pub pixels: String,
    #[serde(default)]
    pub roi: Option<RegionOfInterest>,
}

fn default_channels() -> usize {
    1
}

// POST /api/v1/quality/inspect
async fn post_inspect(State(app): State<AppState>, Json(req): Json<InspectRequest>) -> Response {
    let started = Instant::now();
    let decoded = STANDARD
        .decode(req.pixels.as_bytes())
        .map_err(|e| format!("pixels are not valid base64: {e}"))
        .and_then(|bytes| Image::new(req.width, req.height, req.channels, bytes).map_err(|e| e.to_string()));
    let image = match decoded {
        Ok(image) => image,
        Err(msg) => {
            warn!(part_id = %req.part_id, error = %msg, "inspection request rejected");
            let outcome = OperationResult::<()>::failure_since(ErrorCode::InvalidImage, msg, started);
            return respond(outcome, inspection_status_code);
        }
    };

    let outcome = match req.roi {
        Some(roi) => app.inspector.inspect_region(image, roi, &req.part_id).await,
        None => app.inspector.inspect_part(image, &req.part_id).await,
    };

    if let Some(report) = outcome.result() {
        let priority = match report.inspection_result() {
            InspectionResult::Fail => Priority::High,
            _ => Priority::Normal,
        };
        app.broadcaster.broadcast(
            &ManufacturingEvent::new(QUALITY_INSPECTION, INSPECTOR_COMPONENT, priority)
                .with_data("part_id", report.part_id())
                .with_data("result", report.inspection_result().name())
                .with_data("score", report.overall_score())
                .with_data("defect_count", report.defect_count()),
        );
    }
    respond(outcome, inspection_status_code)
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe(SubscriptionFilter),
}

// GET /api/v1/events (WebSocket)
async fn events_socket(ws: WebSocketUpgrade, State(app): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app))
}

async fn handle_socket(socket: WebSocket, app: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (sink, mut rx) = ChannelSink::pair();
    let subscriber_id = app.broadcaster.subscribe(Arc::new(sink), None);
    info!(subscriber_id = %subscriber_id, "event stream client connected");

    let send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if sender.send(Message::Text(envelope.into())).await.is_err() {
                break;
            }
        }
    });

    let broadcaster = app.broadcaster.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(ClientMessage::Subscribe(filter)) => {
                        debug!(subscriber_id = %subscriber_id, types = filter.event_types.len(), "subscription updated");
                        broadcaster.update_filter(&subscriber_id, Some(filter));
                    }
                    Err(e) => warn!(subscriber_id = %subscriber_id, error = %e, "unrecognised client message"),
                },
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    warn!(subscriber_id = %subscriber_id, error = %e, "event stream error");
                    break;
                }
                _ => {}
            }
        }
    });

    join_first(send_task, recv_task).await;

    app.broadcaster.unsubscribe(&subscriber_id);
    info!(subscriber_id = %subscriber_id, "event stream client disconnected");
}

/// Attend la première des deux tâches et annule l'autre
async fn join_first(mut send_task: JoinHandle<()>, mut recv_task: JoinHandle<()>) {
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(machine_status_code(ErrorCode::UnknownMachine), StatusCode::NOT_FOUND);
        assert_eq!(machine_status_code(ErrorCode::StatusUnavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(command_status_code(ErrorCode::NotSupported), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(command_status_code(ErrorCode::SafetyError), StatusCode::BAD_GATEWAY);
        assert_eq!(inspection_status_code(ErrorCode::InvalidImage), StatusCode::BAD_REQUEST);
        assert_eq!(inspection_status_code(ErrorCode::DetectionFailed), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(inspection_status_code(ErrorCode::InspectionError), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_subscribe_message() {
        let raw = r#"{"type":"subscribe","data":{"event_types":["machine_alarm"],"priority_filter":"HIGH"}}"#;
        let ClientMessage::Subscribe(filter) = serde_json::from_str(raw).unwrap();
        assert!(filter.event_types.contains("machine_alarm"));
        assert_eq!(filter.priority_filter, Some(Priority::High));
        assert!(filter.component_filter.is_none());
    }

    #[tokio::test]
    async fn test_finished_stream_side_aborts_the_other() {
        let (held, released) = tokio::sync::oneshot::channel::<()>();
        let send_task = tokio::spawn(async {});
        let recv_task = tokio::spawn(async move {
            let _held = held;
            std::future::pending::<()>().await;
        });

        join_first(send_task, recv_task).await;
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(1), released).await;
        assert!(matches!(outcome, Ok(Err(_))));
    }

    #[test]
    fn test_command_request_defaults() {
        let req: CommandRequest = serde_json::from_str(r#"{"command":"emergency_stop"}"#).unwrap();
        assert_eq!(req.command, CncCommand::EmergencyStop);
        assert!(!req.safety_confirmation);
        assert!(req.parameters.is_none());
    }
}
