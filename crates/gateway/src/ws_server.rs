//! WebSocket and HTTP handlers using Axum.

use crate::error::Result;
use crate::lifecycle::{Connection, LiveUpdates};
use crate::protocol::{ClientMessage, ServerMessage};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use cart_metrics::{DashboardPayload, ScopeId};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Connections silent for this many ping intervals are closed.
const IDLE_PING_INTERVALS: u32 = 3;

/// Shared application state.
pub struct AppState {
    pub live: Arc<LiveUpdates>,
    /// Interval between server-initiated WebSocket pings.
    pub ping_interval: Duration,
    /// Outbound frame buffer per connection.
    pub client_buffer_size: usize,
}

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/dashboard/{app}", get(dashboard_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "clients": state.live.clients().client_count(),
        "active_scopes": state.live.subscriptions().active_scope_count(),
        "resource_model": state.live.model().as_str(),
    }))
}

/// Current dashboard of one application, for the initial page render.
async fn dashboard_handler(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
) -> std::result::Result<Json<DashboardPayload>, StatusCode> {
    let scope = ScopeId::parse(&Value::String(app)).ok_or(StatusCode::NOT_FOUND)?;

    match state.live.dispatcher().snapshot(scope).await {
        Ok(payload) => Ok(Json(payload)),
        Err(e) => {
            warn!("Dashboard snapshot of scope {} failed: {}", scope, e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Bounded: a slow client loses updates instead of growing memory.
    let (tx, mut rx) = mpsc::channel::<Message>(state.client_buffer_size);

    let mut conn = state.live.connect(tx);
    let client = conn.client().clone();
    info!("Client {} connected", client.id);

    // Forward queued frames to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let idle_timeout = state.ping_interval * IDLE_PING_INTERVALS;
    let mut ping_interval = interval(state.ping_interval);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(msg)) => {
                        if let Err(e) = handle_message(&state, &mut conn, msg).await {
                            debug!("Error handling message from {}: {}", client.id, e);
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", client.id, e);
                        break;
                    }
                }
            }

            _ = ping_interval.tick() => {
                if client.is_closed() {
                    break;
                }
                if client.is_idle(idle_timeout) {
                    info!("Client {} idle for over {:?}, closing", client.id, idle_timeout);
                    break;
                }
                if !client.try_send_raw(Message::Ping(Bytes::new())) {
                    debug!("Skipped ping for {} (buffer full)", client.id);
                }
            }
        }
    }

    let client_id = client.id;
    state.live.disconnect(conn).await;
    send_task.abort();

    info!("Client {} disconnected", client_id);
}

/// Handle a single WebSocket frame.
async fn handle_message(state: &AppState, conn: &mut Connection, msg: Message) -> Result<()> {
    match msg {
        Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
            Ok(client_msg) => handle_client_message(state, conn, client_msg).await,
            Err(e) => {
                debug!("Ignoring malformed message from {}: {}", conn.id(), e);
                Ok(())
            }
        },
        Message::Binary(data) => match serde_json::from_slice::<ClientMessage>(&data) {
            Ok(client_msg) => handle_client_message(state, conn, client_msg).await,
            Err(e) => {
                debug!("Ignoring malformed message from {}: {}", conn.id(), e);
                Ok(())
            }
        },
        Message::Ping(_) | Message::Pong(_) => {
            // axum answers pings itself.
            conn.client().update_ping();
            Ok(())
        }
        Message::Close(_) => Ok(()),
    }
}

/// Handle a parsed client message.
async fn handle_client_message(
    state: &AppState,
    conn: &mut Connection,
    msg: ClientMessage,
) -> Result<()> {
    match msg {
        ClientMessage::RequestDashboardData { app } => {
            debug!("Client {} requested dashboard of {}", conn.id(), app);
            state.live.request_dashboard_data(conn, &app).await;
            Ok(())
        }
        ClientMessage::Ping => {
            conn.client().update_ping();
            conn.client().send(&ServerMessage::Pong)
        }
    }
}
