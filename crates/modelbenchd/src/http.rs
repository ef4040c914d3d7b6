//! HTTP routes and the WebSocket session transport.

use std::future::Future;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{future, SinkExt, StreamExt};
use modelbench_core::{
    ClientCommand, HealthStatus, RunRequest, RunService, RunningJob, Session,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AppState {
    service: Arc<RunService>,
}

/// Routes: `/api/health`, `/api/runs`, `/api/run-test` and the `/ws` session endpoint.
pub fn router(service: Arc<RunService>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/runs", get(running))
        .route("/api/run-test", post(resolve_run))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(AppState { service })
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, service: Arc<RunService>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(state.service.health())
}

async fn running(State(state): State<AppState>) -> Json<Vec<RunningJob>> {
    Json(state.service.registry().snapshot())
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedRun {
    pub test_id: String,
    pub message: String,
    pub script_path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Validate and resolve a request without launching it. The run itself is
/// started over `/ws`, where its output can be streamed.
async fn resolve_run(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<ResolvedRun>, (StatusCode, Json<ErrorResponse>)> {
    let prepared = state.service.prepare(request).map_err(|e| {
        let status = if e.is_rejection() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (
            status,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
    })?;
    Ok(Json(ResolvedRun {
        test_id: prepared.job_id.to_string(),
        message: "Test resolved; send run-test over /ws to start it".to_string(),
        script_path: prepared.script_path.display().to_string(),
    }))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_session(socket, state.service))
}

/// Bridge one WebSocket to a [`Session`]: text frames in, JSON events out.
pub async fn serve_session(socket: WebSocket, service: Arc<RunService>) {
    let (mut sink, stream) = socket.split();
    let (session, mut events) = Session::open(service);
    let session_id = session.id().to_string();

    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match event.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "dropping unserializable event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let inbound = stream
        .take_while(|frame| future::ready(!matches!(frame, Ok(Message::Close(_)) | Err(_))))
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(ClientCommand::parse(&text)),
                Ok(Message::Binary(bytes)) => Some(match std::str::from_utf8(&bytes) {
                    Ok(text) => ClientCommand::parse(text),
                    Err(_) => ClientCommand::Malformed("binary frames must be UTF-8 JSON".to_string()),
                }),
                _ => None,
            })
        });

    let state = session.drive(Box::pin(inbound)).await;
    debug!(session_id = %session_id, state = ?state, "websocket closed");
    writer.abort();
}
