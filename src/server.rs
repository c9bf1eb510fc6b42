//! HTTP surface: session REST endpoints and the per-session WebSocket.
//!
//! Every route authenticates a bearer credential: `Authorization: Bearer`
//! for REST, the same header or a `token` query parameter for the WebSocket
//! handshake (browsers cannot set headers on socket upgrades). A failed
//! WebSocket handshake still completes the upgrade and then closes with a
//! policy-violation code, so the client sees a clean close instead of a
//! protocol error; no events are ever sent on such a socket.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;

use crate::auth::TokenVerifier;
use crate::events::{ClientMessage, ServerEvent};
use crate::session::SessionManager;
use crate::types::UserId;
use crate::{Error, Result};

/// WebSocket close code for failed authentication (RFC 6455 policy violation).
const CLOSE_POLICY_VIOLATION: u16 = 1008;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub verifier: TokenVerifier,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/ws", get(session_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Wrapper mapping service errors onto HTTP responses.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::TurnActive => StatusCode::CONFLICT,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Pull the caller's identity out of a request.
fn authenticate(
    verifier: &TokenVerifier,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<UserId> {
    let header_token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let credential = header_token
        .or_else(|| query.get("token").map(String::as_str))
        .ok_or_else(|| Error::unauthorized("missing credential"))?;
    verifier.current_user(credential)
}

async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    let user = authenticate(&state.verifier, &headers, &HashMap::new())?;
    let sessions = state.manager.store().list_sessions(&user)?;
    let out: Vec<_> = sessions
        .into_iter()
        .map(|s| json!({ "id": s.id, "title": s.title, "created_at": s.created_at }))
        .collect();
    Ok(Json(json!(out)))
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    let user = authenticate(&state.verifier, &headers, &HashMap::new())?;
    let record = state
        .manager
        .store()
        .get_session(&user, &session_id)?
        .ok_or_else(|| Error::not_found(format!("session {session_id}")))?;
    let messages = state.manager.store().restore_messages(&session_id)?;

    let profile = &record.profile;
    let columns: Vec<_> = profile
        .columns
        .iter()
        .map(|c| {
            json!({
                "name": &c.name,
                "type": c.column_type.as_str(),
                "null_count": c.null_count,
            })
        })
        .collect();

    Ok(Json(json!({
        "id": &record.meta.id,
        "title": &record.meta.title,
        "created_at": record.meta.created_at,
        "file": {
            "filename": &profile.filename,
            "row_count": profile.row_count,
            "column_count": profile.column_count,
            "columns": columns,
            "preview": profile.preview(),
        },
        "messages": messages,
    })))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> std::result::Result<StatusCode, ApiError> {
    let user = authenticate(&state.verifier, &headers, &HashMap::new())?;
    if state.manager.delete_session(&user, &session_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::not_found(format!("session {session_id}")).into())
    }
}

async fn session_ws(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    // Authenticate and authorize before accepting; the socket is still
    // upgraded either way so the failure is a clean policy close.
    let user = authenticate(&state.verifier, &headers, &query).and_then(|user| {
        match state.manager.store().get_session(&user, &session_id)? {
            Some(_) => Ok(user),
            None => Err(Error::unauthorized("unknown session")),
        }
    });

    ws.on_upgrade(move |socket| async move {
        match user {
            Ok(user) => run_socket(socket, state, user, session_id).await,
            Err(err) => {
                tracing::debug!(session = %session_id, error = %err, "websocket rejected");
                close_policy_violation(socket).await;
            }
        }
    })
}

async fn close_policy_violation(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: "unauthorized".into(),
        })))
        .await;
}

/// Pump one authenticated socket: outgoing events from the session sink,
/// incoming client messages into the session runtime.
async fn run_socket(socket: WebSocket, state: AppState, user: UserId, session_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let runtime = state.manager.runtime(&session_id);
    let (tx, rx) = mpsc::channel(state.manager.settings().event_buffer);
    runtime.attach_transport(tx);

    let forward = tokio::spawn(async move {
        let mut events = ReceiverStream::new(rx);
        while let Some(event) = events.next().await {
            let Ok(text) = serde_json::to_string(&event) else { continue };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Text(text) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_message) => {
                        if let Err(err) = state
                            .manager
                            .handle_client_message(&user, &session_id, client_message)
                            .await
                        {
                            runtime.sink().emit_direct(ServerEvent::error(err.to_string())).await;
                        }
                    }
                    Err(_) => {
                        runtime
                            .sink()
                            .emit_direct(ServerEvent::error("unrecognized message"))
                            .await;
                    }
                }
            }
            Message::Close(_) => break,
            // Pings are answered by axum; binary frames are not part of the
            // protocol.
            _ => {}
        }
    }

    // Socket gone. Leave the runtime in place: an active turn keeps running
    // and a reconnect re-attaches to it.
    forward.abort();
}
