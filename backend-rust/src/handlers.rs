//! HTTP/JSON surface and the controller WebSocket.
//!
//! Route map (CORS allow-all and trailing-slash normalization are layered on
//! in `main`):
//!
//! - `GET  /edmos`                          connected robot identifiers
//! - `GET  /sessions`                       session summaries
//! - `GET  /sessions/:id`                   detailed session view, 404 unknown
//! - `PUT  /sessions/:id/tasks`             `{"key", "completed"}`
//! - `PUT  /sessions/:id/helpEnabled`       `{"Value": bool}`
//! - `PUT  /sessions/:id/feedback`          raw text
//! - `GET/PUT /simpleView`                  `{"Value": bool}`, global
//! - `GET  /controller/:id`                 player signaling socket
//! - `GET  /controller/:id/override/:n`     operator override socket
//!
//! The controller socket carries the signaling handshake; when no WebRTC
//! stack is attached it then doubles as the player's data channel (see
//! `peer`).

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::backend::{BackendEvent, SharedBackend};
use crate::peer::{PeerCommand, PeerEvent, PeerHandle};
use crate::session::MAX_PLAYER_COUNT;

pub fn router(backend: SharedBackend) -> Router {
    Router::new()
        .route("/edmos", get(get_edmos))
        .route("/sessions", get(get_sessions))
        .route("/sessions/:identifier", get(get_session_detail))
        .route("/sessions/:identifier/tasks", put(put_task_state))
        .route("/sessions/:identifier/helpEnabled", put(put_help_enabled))
        .route("/sessions/:identifier/feedback", put(put_feedback))
        .route("/simpleView", get(get_simple_view).put(put_simple_view))
        .route("/controller/:identifier", get(controller_ws))
        .route(
            "/controller/:identifier/override/:number",
            get(overrider_ws),
        )
        .with_state(backend)
}

// ── Observation ───────────────────────────────────────────────────────────────

async fn get_edmos(State(backend): State<SharedBackend>) -> Json<Vec<String>> {
    Json(backend.read().await.connected_robots())
}

async fn get_sessions(State(backend): State<SharedBackend>) -> Json<Vec<serde_json::Value>> {
    Json(backend.read().await.sessions_info())
}

async fn get_session_detail(
    State(backend): State<SharedBackend>,
    Path(identifier): Path<String>,
) -> Response {
    match backend.read().await.session(&identifier) {
        Some(session) => Json(session.detailed_info()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// ── Operator actions ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TaskUpdate {
    key: String,
    completed: bool,
}

async fn put_task_state(
    State(backend): State<SharedBackend>,
    Path(identifier): Path<String>,
    body: String,
) -> StatusCode {
    let mut backend = backend.write().await;
    let Some(session) = backend.session_mut(&identifier) else {
        return StatusCode::NOT_FOUND;
    };
    let Ok(update) = serde_json::from_str::<TaskUpdate>(&body) else {
        return StatusCode::BAD_REQUEST;
    };
    if session.set_task(&update.key, update.completed) {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    }
}

#[derive(Deserialize)]
struct FlagBody {
    #[serde(rename = "Value")]
    value: bool,
}

async fn put_help_enabled(
    State(backend): State<SharedBackend>,
    Path(identifier): Path<String>,
    body: String,
) -> StatusCode {
    let mut backend = backend.write().await;
    let Some(session) = backend.session_mut(&identifier) else {
        return StatusCode::NOT_FOUND;
    };
    let Ok(flag) = serde_json::from_str::<FlagBody>(&body) else {
        return StatusCode::BAD_REQUEST;
    };
    session.set_help_enabled(flag.value);
    StatusCode::OK
}

async fn put_feedback(
    State(backend): State<SharedBackend>,
    Path(identifier): Path<String>,
    body: String,
) -> StatusCode {
    if body.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    let mut backend = backend.write().await;
    let Some(session) = backend.session_mut(&identifier) else {
        return StatusCode::NOT_FOUND;
    };
    session.send_feedback(&body);
    StatusCode::OK
}

async fn get_simple_view(State(backend): State<SharedBackend>) -> Json<serde_json::Value> {
    Json(json!({ "Value": backend.read().await.simple_view() }))
}

async fn put_simple_view(State(backend): State<SharedBackend>, body: String) -> StatusCode {
    let Ok(flag) = serde_json::from_str::<FlagBody>(&body) else {
        return StatusCode::BAD_REQUEST;
    };
    backend.write().await.set_simple_view(flag.value);
    StatusCode::OK
}

// ── Controller socket ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ControllerHello {
    #[serde(rename = "playerName")]
    player_name: String,
    /// The browser's SDP offer, relayed to the WebRTC collaborator.
    #[serde(rename = "handshake")]
    _offer: serde_json::Value,
}

/// Everything that can be refused before paying for the upgrade: 404 for a
/// robot nobody has seen, 401 for a session with no seat left.
fn controller_refusal(backend: &crate::backend::EdmoBackend, identifier: &str) -> Option<StatusCode> {
    if !backend.is_robot_known(identifier) {
        return Some(StatusCode::NOT_FOUND);
    }
    if backend
        .session(identifier)
        .is_some_and(|s| s.is_saturated())
    {
        return Some(StatusCode::UNAUTHORIZED);
    }
    None
}

fn overrider_refusal(
    backend: &crate::backend::EdmoBackend,
    identifier: &str,
    number: u8,
) -> Option<StatusCode> {
    if !backend.is_robot_known(identifier) || number as usize >= MAX_PLAYER_COUNT {
        return Some(StatusCode::NOT_FOUND);
    }
    None
}

async fn controller_ws(
    State(backend): State<SharedBackend>,
    Path(identifier): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(status) = controller_refusal(&*backend.read().await, &identifier) {
        return status.into_response();
    }
    ws.on_upgrade(move |socket| controller_session(socket, backend, identifier, None))
}

async fn overrider_ws(
    State(backend): State<SharedBackend>,
    Path((identifier, number)): Path<(String, u8)>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(status) = overrider_refusal(&*backend.read().await, &identifier, number) {
        return status.into_response();
    }
    ws.on_upgrade(move |socket| controller_session(socket, backend, identifier, Some(number)))
}

/// Signaling exchange, admission, then the channel loop.
async fn controller_session(
    mut socket: WebSocket,
    backend: SharedBackend,
    robot: String,
    override_number: Option<u8>,
) {
    let hello = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ControllerHello>(&text) {
                    Ok(hello) => break hello,
                    Err(e) => {
                        debug!("controller {robot}: bad handshake: {e}");
                        return;
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return,
        }
    };

    let (peer, mut commands) = PeerHandle::pair();
    let (player, events) = {
        let mut guard = backend.write().await;
        let events = guard.event_sender();
        let admitted = match override_number {
            Some(number) => guard.register_overrider(&robot, peer, number),
            None => guard.register_player(&robot, peer, &hello.player_name),
        };
        match admitted {
            Ok(player) => (player, events),
            Err(e) => {
                warn!("controller {robot}: admission refused: {e}");
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        }
    };

    // With a WebRTC stack attached the answer comes from its negotiation;
    // standalone, this socket is the data channel and says so.
    let answer = json!({ "type": "answer", "transport": "websocket" }).to_string();
    if socket.send(Message::Text(answer)).await.is_err() {
        let _ = events.send(BackendEvent::Peer {
            robot,
            player,
            event: PeerEvent::Closed,
        });
        return;
    }

    let _ = events.send(BackendEvent::Peer {
        robot: robot.clone(),
        player,
        event: PeerEvent::Open,
    });

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(PeerCommand::Text(text)) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(PeerCommand::Close) | None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(BackendEvent::Peer {
                        robot: robot.clone(),
                        player,
                        event: PeerEvent::Message(text),
                    });
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("controller {robot}: socket error: {e}");
                    break;
                }
            },
        }
    }

    let _ = events.send(BackendEvent::Peer {
        robot,
        player,
        event: PeerEvent::Closed,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EdmoBackend;
    use crate::serial_link::SerialConfig;
    use crate::tasks::TaskCatalog;
    use crate::udp_link::UdpConfig;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    async fn test_router() -> (Router, SharedBackend) {
        let log_root = std::env::temp_dir().join(format!("edmo-http-{}", uuid::Uuid::new_v4()));
        let backend = EdmoBackend::new(
            SerialConfig::default(),
            UdpConfig::loopback(),
            TaskCatalog::default(),
            log_root,
        )
        .await
        .unwrap();
        let shared: SharedBackend = Arc::new(RwLock::new(backend));
        (router(shared.clone()), shared)
    }

    #[tokio::test]
    async fn unknown_session_is_404() {
        let (app, _backend) = test_router().await;
        let response = app
            .oneshot(Request::get("/sessions/NOPE").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn edmos_listing_is_ok_when_empty() {
        let (app, _backend) = test_router().await;
        let response = app
            .oneshot(Request::get("/edmos").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn simple_view_put_validates_shape() {
        let (app, backend) = test_router().await;

        let response = app
            .clone()
            .oneshot(
                Request::put("/simpleView")
                    .body(Body::from(r#"{"Value": true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(backend.read().await.simple_view());

        let response = app
            .oneshot(
                Request::put("/simpleView")
                    .body(Body::from(r#"{"Value": "yes"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn task_update_on_unknown_session_is_404() {
        let (app, _backend) = test_router().await;
        let response = app
            .oneshot(
                Request::put("/sessions/R1/tasks")
                    .body(Body::from(r#"{"key": "Wave", "completed": true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn controller_admission_refusals() {
        let (_app, backend) = test_router().await;
        let guard = backend.read().await;
        assert_eq!(
            controller_refusal(&*guard, "NOPE"),
            Some(StatusCode::NOT_FOUND)
        );
        assert_eq!(
            overrider_refusal(&*guard, "NOPE", 0),
            Some(StatusCode::NOT_FOUND)
        );
        assert_eq!(
            overrider_refusal(&*guard, "NOPE", 9),
            Some(StatusCode::NOT_FOUND)
        );
    }
}
